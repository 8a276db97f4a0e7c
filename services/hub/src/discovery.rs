//! Sibling-hub discovery for room systems.
//!
//! Hubs in the same room find each other through the device registry: every
//! event-router device in the room carries a trailing integer in its id, and
//! each hub dials only the devices numbered at or above its own (skipping
//! itself).  Any pair then produces exactly one edge, so the full mesh forms
//! without duplicate connections.

use fabric_registry::{Device, DeviceRegistry, RegistryError, device_room_prefix};

/// Registry role carried by hub devices.
pub const HUB_ROLE: &str = "EventRouter";
/// Registry device type carried by hub devices.
pub const HUB_DEVICE_TYPE: &str = "Pi3";

/// The trailing integer of a device id, e.g. `ITB-1010-CP2` → 2.
pub fn trailing_number(id: &str) -> Option<u32> {
    let digits: Vec<char> = id
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.iter().rev().collect::<String>().parse().ok()
}

/// The peer hubs this instance should dial.
///
/// In development (`dev_hub`) every hub in the room is included regardless
/// of numbering; self is always skipped.
pub async fn sibling_hubs<R: DeviceRegistry>(
    registry: &R,
    system_id: &str,
    dev_hub: bool,
) -> Result<Vec<Device>, RegistryError> {
    let Some(room) = device_room_prefix(system_id) else {
        return Ok(Vec::new());
    };
    let mine = trailing_number(system_id);

    let devices = registry
        .devices_by_role_and_type(HUB_ROLE, HUB_DEVICE_TYPE)
        .await?;

    Ok(devices
        .into_iter()
        .filter(|d| {
            if d.id == system_id {
                return false;
            }
            if device_room_prefix(&d.id).as_deref() != Some(room.as_str()) {
                return false;
            }
            if dev_hub {
                return true;
            }
            match (trailing_number(&d.id), mine) {
                (Some(theirs), Some(ours)) => theirs >= ours,
                _ => false,
            }
        })
        .collect())
}

/// Address to dial for a peer hub: the hub port is appended when the
/// registry address carries none.
pub fn dial_address(addr: &str) -> String {
    if addr.contains(':') {
        addr.to_owned()
    } else {
        format!("{addr}:{}", crate::config::DEFAULT_PORT)
    }
}
