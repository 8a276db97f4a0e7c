//! Repeater core: fan events out from the hub to edge targets.
//!
//! The dispatch loop consumes the upstream messenger and routes each event
//! by its room through the send map.  `http`-prefixed targets go through
//! the HTTP buffer; anything else is a pumping-station peer, started on
//! demand and cached in the connection map until it tears itself down.

use crate::config;
use crate::http_buffer::{self, HttpBuffer};
use crate::station::{self, StationContext, StationHandle};
use fabric_protocol::EventWrapper;
use fabric_registry::DeviceRegistry;
use messenger::Messenger;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

/// Local producers queue here instead of on the messenger's own queue.
pub const HUB_SEND_BUFFER: usize = 1000;

// ---------------------------------------------------------------------------
// Connection map
// ---------------------------------------------------------------------------

/// Station registry keyed by target id.  Readers are dispatch lookups;
/// writers are station registration and teardown.
#[derive(Debug, Clone, Default)]
pub struct Connections {
    inner: Arc<RwLock<HashMap<String, StationHandle>>>,
}

impl Connections {
    pub fn new() -> Connections {
        Connections::default()
    }

    /// Insert a station, disambiguating a duplicate id with `:N` suffixes
    /// until it is unique.  Returns the handle under its final id.
    pub async fn register(&self, handle: StationHandle) -> StationHandle {
        let mut map = self.inner.write().await;
        let mut id = handle.id.clone();
        let mut n = 0;
        while map.contains_key(&id) {
            n += 1;
            warn!(id = %handle.id, "duplicate station id, trying {}:{}", handle.id, n);
            id = format!("{}:{}", handle.id, n);
        }
        let handle = handle.with_id(id.clone());
        map.insert(id.clone(), handle.clone());
        info!(id = %id, "station registered");
        handle
    }

    /// Remove a station.  Stations call this themselves on exit.
    pub async fn unregister(&self, id: &str) {
        self.inner.write().await.remove(id);
        info!(id = %id, "station removed");
    }

    pub async fn get(&self, id: &str) -> Option<StationHandle> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ---------------------------------------------------------------------------
// Repeater
// ---------------------------------------------------------------------------

pub struct Repeater<R> {
    messenger: Messenger,
    registry: R,
    /// room → targets; the `"*"` entry applies to every event.
    send_map: HashMap<String, Vec<String>>,
    connections: Connections,
    http_buffer: HttpBuffer,
    hub_send_tx: mpsc::Sender<EventWrapper>,
    hub_send_rx: mpsc::Receiver<EventWrapper>,
    system_id: String,
}

impl<R: DeviceRegistry + Send + Sync + 'static> Repeater<R> {
    pub fn new(
        messenger: Messenger,
        send_map: HashMap<String, Vec<String>>,
        registry: R,
        system_id: String,
    ) -> Repeater<R> {
        let (hub_send_tx, hub_send_rx) = mpsc::channel(HUB_SEND_BUFFER);
        Repeater {
            messenger,
            registry,
            send_map,
            connections: Connections::new(),
            http_buffer: HttpBuffer::start(http_buffer::REQUEST_TIMEOUT, http_buffer::BUFFER_SIZE),
            hub_send_tx,
            hub_send_rx,
            system_id,
        }
    }

    pub fn connections(&self) -> Connections {
        self.connections.clone()
    }

    pub fn http_buffer(&self) -> HttpBuffer {
        self.http_buffer.clone()
    }

    /// Queue for events headed upstream (station inbound traffic, `/send`).
    pub fn hub_send(&self) -> mpsc::Sender<EventWrapper> {
        self.hub_send_tx.clone()
    }

    pub fn station_context(&self) -> StationContext {
        StationContext {
            connections: self.connections.clone(),
            receive_tx: self.hub_send_tx.clone(),
            system_id: self.system_id.clone(),
        }
    }

    /// Run the upstream drain and the dispatch loop until the messenger is
    /// killed.
    pub async fn run(self) {
        let Repeater {
            messenger,
            registry,
            send_map,
            connections,
            http_buffer,
            hub_send_tx,
            mut hub_send_rx,
            system_id,
        } = self;

        // Local producers never block on the messenger's own queue.
        let upstream = messenger.clone();
        tokio::spawn(async move {
            while let Some(wrapper) = hub_send_rx.recv().await {
                upstream.send(wrapper).await;
            }
        });

        let ctx = StationContext {
            connections: connections.clone(),
            receive_tx: hub_send_tx,
            system_id,
        };

        info!("repeater dispatch loop running");
        while let Some(wrapper) = messenger.receive().await {
            dispatch(
                &wrapper,
                &send_map,
                &connections,
                &http_buffer,
                &registry,
                &ctx,
            )
            .await;
        }
        info!("upstream messenger closed, dispatch loop exiting");
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Route one event to every target listed for its room plus the wildcard
/// targets.
pub async fn dispatch<R: DeviceRegistry>(
    wrapper: &EventWrapper,
    send_map: &HashMap<String, Vec<String>>,
    connections: &Connections,
    http_buffer: &HttpBuffer,
    registry: &R,
    ctx: &StationContext,
) {
    let mut targets = send_map.get(&wrapper.room).cloned().unwrap_or_default();
    if let Some(star) = send_map.get("*") {
        targets.extend(star.iter().cloned());
    }

    for target in targets {
        if target.starts_with("http") {
            http_buffer
                .send(wrapper.event.clone(), "POST", &target)
                .await;
            continue;
        }

        if let Some(station) = connections.get(&target).await {
            station.send(wrapper.clone()).await;
            continue;
        }

        info!(target = %target, room = %wrapper.room, "no station cached, starting one");
        let Some(addr) = resolve_target(registry, &target).await else {
            continue;
        };
        let station =
            station::start_connection(ctx.clone(), target, wrapper.room.clone(), addr).await;
        station.send(wrapper.clone()).await;
    }
}

/// Resolve a target to a dialable address: device ids go through the
/// registry, literal addresses are used verbatim, and the translator port
/// is appended when none is present.
async fn resolve_target<R: DeviceRegistry>(registry: &R, target: &str) -> Option<String> {
    let addr = if is_literal_address(target) {
        target.to_owned()
    } else {
        match registry.device(target).await {
            Ok(device) => device.address,
            Err(e) => {
                error!(target = %target, error = %e, "couldn't resolve target");
                return None;
            }
        }
    };

    if addr.contains(':') {
        Some(addr)
    } else {
        Some(format!("{addr}:{}", config::DEFAULT_PORT))
    }
}

/// Device ids are dash-separated names; anything with a dot or a port is an
/// address already.
fn is_literal_address(target: &str) -> bool {
    let looks_dialable = target.contains(':') || target.contains('.');
    if !looks_dialable {
        debug!(target = %target, "treating target as a device id");
    }
    looks_dialable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_addresses_are_recognised() {
        assert!(is_literal_address("10.0.0.8"));
        assert!(is_literal_address("central.example.com:7101"));
        assert!(is_literal_address("localhost:7101"));
        assert!(!is_literal_address("ITB-1010-CP1"));
    }
}
