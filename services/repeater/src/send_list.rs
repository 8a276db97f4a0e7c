//! Send-list construction.
//!
//! The send list maps a room to the targets that care about its events:
//! the event-router device in every other room, plus an optional central
//! repeater under the wildcard room `"*"`.

use crate::config::RepeaterConfig;
use fabric_registry::{DeviceRegistry, RegistryError, device_room_prefix, wait_until_ready};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

pub const REPEATER_ROLE: &str = "EventRouter";
pub const REPEATER_DEVICE_TYPE: &str = "Pi3";

/// Poll interval while waiting for registry replication.
pub const REGISTRY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Build the room → targets map from the device registry.
///
/// Room systems wait for registry replication first (bypassed by
/// `STOP_REPLICATION`) and exclude their own room.
pub async fn build_send_list<R: DeviceRegistry>(
    registry: &R,
    cfg: &RepeaterConfig,
) -> Result<HashMap<String, Vec<String>>, RegistryError> {
    info!("building the send list");
    let mut send_list: HashMap<String, Vec<String>> = HashMap::new();

    let own_room = if cfg.room_system {
        device_room_prefix(&cfg.system_id)
    } else {
        None
    };

    if cfg.room_system && !cfg.stop_replication {
        wait_until_ready(registry, REGISTRY_POLL_INTERVAL).await;
    }

    let devices = registry
        .devices_by_role_and_type(REPEATER_ROLE, REPEATER_DEVICE_TYPE)
        .await?;
    debug!(count = devices.len(), "got event router devices");

    for device in devices {
        let Some(room) = device_room_prefix(&device.id) else {
            debug!(id = %device.id, "device id has no room prefix, skipping");
            continue;
        };
        if own_room.as_deref() == Some(room.as_str()) {
            continue;
        }
        send_list.entry(room).or_default().push(device.id);
    }

    match &cfg.central_repeater_address {
        Some(central) => {
            send_list.insert("*".to_owned(), vec![central.clone()]);
        }
        None => {
            info!("CENTRAL_REPEATER_ADDRESS not set, events will not reach a central repeater");
        }
    }

    info!(rooms = send_list.len(), "send list built");
    Ok(send_list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_registry::{Device, MemoryRegistry};

    fn router(id: &str) -> Device {
        Device {
            id: id.to_owned(),
            address: format!("{}.example.com", id.to_lowercase()),
            device_type: REPEATER_DEVICE_TYPE.to_owned(),
            roles: vec![REPEATER_ROLE.to_owned()],
        }
    }

    fn room_config(system_id: &str) -> RepeaterConfig {
        RepeaterConfig {
            port: 7101,
            hub_address: "ws://localhost:7100".to_owned(),
            system_id: system_id.to_owned(),
            room_system: true,
            central_repeater_address: None,
            stop_replication: true,
            registry_address: None,
        }
    }

    #[tokio::test]
    async fn groups_devices_by_room_and_excludes_own_room() {
        let reg = MemoryRegistry::new();
        reg.add_device(router("ITB-1010-CP1"));
        reg.add_device(router("ITB-1020-CP1"));
        reg.add_device(router("ITB-1020-CP2"));
        reg.add_device(router("JKB-2001-CP1"));

        let cfg = room_config("ITB-1010-CP1");
        let list = build_send_list(&reg, &cfg).await.expect("build");

        assert!(!list.contains_key("ITB-1010"));
        assert_eq!(
            list.get("ITB-1020").map(Vec::as_slice),
            Some(&["ITB-1020-CP1".to_owned(), "ITB-1020-CP2".to_owned()][..])
        );
        assert_eq!(
            list.get("JKB-2001").map(Vec::as_slice),
            Some(&["JKB-2001-CP1".to_owned()][..])
        );
    }

    #[tokio::test]
    async fn central_repeater_lands_under_the_wildcard_room() {
        let reg = MemoryRegistry::new();
        reg.add_device(router("ITB-1020-CP1"));

        let mut cfg = room_config("ITB-1010-CP1");
        cfg.central_repeater_address = Some("central.example.com:7101".to_owned());
        let list = build_send_list(&reg, &cfg).await.expect("build");

        assert_eq!(
            list.get("*").map(Vec::as_slice),
            Some(&["central.example.com:7101".to_owned()][..])
        );
    }

    #[tokio::test]
    async fn non_room_systems_keep_every_room() {
        let reg = MemoryRegistry::new();
        reg.add_device(router("ITB-1010-CP1"));
        reg.add_device(router("ITB-1020-CP1"));

        let mut cfg = room_config("ITB-1010-CP1");
        cfg.room_system = false;
        let list = build_send_list(&reg, &cfg).await.expect("build");

        assert!(list.contains_key("ITB-1010"));
        assert!(list.contains_key("ITB-1020"));
    }
}
