//! The routing core.
//!
//! A single-writer actor owns every registry; mutations and events arrive as
//! messages on two bounded queues and are applied strictly one at a time, so
//! a registration change is never interleaved with an event's fan-out.
//!
//! Routing policy, by event source:
//! - every event goes to the messengers subscribed to its room, except back
//!   to the messenger that published it;
//! - messenger-sourced events additionally go to every peer hub and to
//!   exactly one repeater, selected round-robin;
//! - repeater-sourced events go to every peer hub, unless this hub is a room
//!   nexus (repeater-sourced events already reach every repeater in a local
//!   system);
//! - hub-sourced events propagate no further, which terminates the
//!   hub-to-hub flood.

use crate::status::{NexusStatus, RegStatus};
use fabric_protocol::{EventWrapper, SourceType};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Capacity of the registration/control queue.
pub const REGISTRATION_BUFFER: usize = 100;

/// Capacity of the event distribution queue.
pub const DISTRIBUTION_BUFFER: usize = 5000;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A destination the nexus can deliver to.  The channel is owned by the
/// registering endpoint; the nexus only ever sends into it.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,
    pub channel: mpsc::Sender<EventWrapper>,
}

/// An event plus its provenance.  Never crosses the wire.
#[derive(Debug)]
struct HubEventWrapper {
    wrapper: EventWrapper,
    source: SourceType,
    source_id: String,
}

#[derive(Debug)]
enum Control {
    Register {
        rooms: Vec<String>,
        registration: Registration,
        conn_type: SourceType,
    },
    Deregister {
        rooms: Vec<String>,
        conn_type: SourceType,
        id: String,
    },
    Status {
        reply: oneshot::Sender<NexusStatus>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum NexusError {
    /// The submission carried an empty source id.
    #[error("can't submit with a blank source id")]
    InvalidSubmission,
    /// The routing task is gone; only possible during shutdown.
    #[error("nexus is no longer running")]
    Closed,
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to the routing actor.  Cheap to clone; every endpoint holds one.
#[derive(Debug, Clone)]
pub struct Nexus {
    control_tx: mpsc::Sender<Control>,
    distribution_tx: mpsc::Sender<HubEventWrapper>,
}

impl Nexus {
    /// Spawn the routing actor.  `room_nexus` enables local-only semantics:
    /// repeater-sourced events are not propagated to peer hubs.
    pub fn start(room_nexus: bool) -> Nexus {
        let (control_tx, control_rx) = mpsc::channel(REGISTRATION_BUFFER);
        let (distribution_tx, distribution_rx) = mpsc::channel(DISTRIBUTION_BUFFER);

        let router = Router {
            messenger_registry: HashMap::new(),
            room_index: HashMap::new(),
            hub_registry: Vec::new(),
            repeater_registry: Vec::new(),
            cur_repeater: 0,
            room_nexus,
            control_capacity: REGISTRATION_BUFFER,
            distribution_capacity: DISTRIBUTION_BUFFER,
            control_tx: control_tx.clone(),
            distribution_tx: distribution_tx.clone(),
        };
        tokio::spawn(router.run(control_rx, distribution_rx));

        Nexus {
            control_tx,
            distribution_tx,
        }
    }

    /// Submit an event for routing.  Blocks while the distribution queue is
    /// full; that backpressure is intentional.
    pub async fn submit(
        &self,
        wrapper: EventWrapper,
        source: SourceType,
        source_id: &str,
    ) -> Result<(), NexusError> {
        if source_id.is_empty() {
            return Err(NexusError::InvalidSubmission);
        }
        self.distribution_tx
            .send(HubEventWrapper {
                wrapper,
                source,
                source_id: source_id.to_owned(),
            })
            .await
            .map_err(|_| NexusError::Closed)
    }

    /// Register a connection.  Messengers pass the rooms they subscribe to;
    /// hubs and repeaters pass an empty list, which is ignored.
    pub async fn register(
        &self,
        rooms: Vec<String>,
        channel: mpsc::Sender<EventWrapper>,
        id: String,
        conn_type: SourceType,
    ) -> Result<(), NexusError> {
        self.control_tx
            .send(Control::Register {
                rooms,
                registration: Registration { id, channel },
                conn_type,
            })
            .await
            .map_err(|_| NexusError::Closed)
    }

    /// Deregister a connection.  For messengers an empty `rooms` list means
    /// "every room this id is subscribed to".
    pub async fn deregister(
        &self,
        rooms: Vec<String>,
        conn_type: SourceType,
        id: String,
    ) -> Result<(), NexusError> {
        self.control_tx
            .send(Control::Deregister {
                rooms,
                conn_type,
                id,
            })
            .await
            .map_err(|_| NexusError::Closed)
    }

    /// Snapshot of registries and queue utilisation, answered by the actor
    /// so no registry is ever read outside its own task.
    pub async fn status(&self) -> Result<NexusStatus, NexusError> {
        let (reply, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Status { reply })
            .await
            .map_err(|_| NexusError::Closed)?;
        rx.await.map_err(|_| NexusError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Routing actor
// ---------------------------------------------------------------------------

struct Router {
    /// room → subscribed messengers.
    messenger_registry: HashMap<String, Vec<Registration>>,
    /// registration id → rooms, so a disconnecting messenger that names no
    /// rooms can still be removed everywhere.
    room_index: HashMap<String, Vec<String>>,
    hub_registry: Vec<Registration>,
    repeater_registry: Vec<Registration>,
    /// Round-robin cursor over `repeater_registry`, taken modulo the current
    /// length at each use because entries come and go.
    cur_repeater: usize,
    room_nexus: bool,

    control_capacity: usize,
    distribution_capacity: usize,
    // Held for utilisation reporting only; the actor never sends to itself.
    control_tx: mpsc::Sender<Control>,
    distribution_tx: mpsc::Sender<HubEventWrapper>,
}

impl Router {
    async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<Control>,
        mut distribution_rx: mpsc::Receiver<HubEventWrapper>,
    ) {
        loop {
            tokio::select! {
                Some(event) = distribution_rx.recv() => self.route(event).await,
                Some(change) = control_rx.recv() => self.apply(change),
                else => break,
            }
        }
    }

    async fn route(&mut self, event: HubEventWrapper) {
        // Local delivery, skipping the publisher itself.
        if let Some(regs) = self.messenger_registry.get(&event.wrapper.room) {
            for reg in regs {
                if event.source == SourceType::Messenger && reg.id == event.source_id {
                    continue;
                }
                deliver(reg, &event.wrapper).await;
            }
        }

        // Tier fan-out by source.
        match event.source {
            SourceType::Messenger => {
                for hub in &self.hub_registry {
                    deliver(hub, &event.wrapper).await;
                }
                if self.repeater_registry.is_empty() {
                    debug!(room = %event.wrapper.room, "no repeaters registered, skipping");
                } else {
                    self.cur_repeater = (self.cur_repeater + 1) % self.repeater_registry.len();
                    deliver(&self.repeater_registry[self.cur_repeater], &event.wrapper).await;
                }
            }
            SourceType::Repeater => {
                // In a room nexus, repeater events already reach every
                // repeater in the local system.
                if !self.room_nexus {
                    for hub in &self.hub_registry {
                        deliver(hub, &event.wrapper).await;
                    }
                }
            }
            SourceType::Hub => {
                // Flood termination.
            }
        }
    }

    fn apply(&mut self, change: Control) {
        match change {
            Control::Register {
                rooms,
                registration,
                conn_type,
            } => match conn_type {
                SourceType::Messenger => self.register_messenger(rooms, registration),
                SourceType::Repeater => {
                    add_to_registry(&mut self.repeater_registry, registration, conn_type);
                }
                SourceType::Hub => {
                    add_to_registry(&mut self.hub_registry, registration, conn_type);
                }
            },
            Control::Deregister {
                rooms,
                conn_type,
                id,
            } => match conn_type {
                SourceType::Messenger => self.deregister_messenger(rooms, &id),
                SourceType::Repeater => {
                    remove_from_registry(&mut self.repeater_registry, &id, conn_type);
                }
                SourceType::Hub => {
                    remove_from_registry(&mut self.hub_registry, &id, conn_type);
                }
            },
            Control::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn register_messenger(&mut self, rooms: Vec<String>, registration: Registration) {
        info!(id = %registration.id, rooms = ?rooms, "registering messenger");
        for room in rooms {
            let regs = self.messenger_registry.entry(room.clone()).or_default();
            if regs.iter().any(|r| r.id == registration.id) {
                warn!(room = %room, id = %registration.id, "duplicate registration ignored");
                continue;
            }
            regs.push(registration.clone());
            let indexed = self.room_index.entry(registration.id.clone()).or_default();
            if !indexed.contains(&room) {
                indexed.push(room);
            }
        }
    }

    fn deregister_messenger(&mut self, rooms: Vec<String>, id: &str) {
        // No rooms named means every room this id is subscribed to.
        let rooms = if rooms.is_empty() {
            self.room_index.get(id).cloned().unwrap_or_default()
        } else {
            rooms
        };

        info!(id = %id, rooms = ?rooms, "deregistering messenger");
        for room in &rooms {
            let Some(regs) = self.messenger_registry.get_mut(room) else {
                debug!(room = %room, id = %id, "removal of unknown registration");
                continue;
            };
            if let Some(pos) = regs.iter().position(|r| r.id == id) {
                // Order within a room doesn't matter.
                regs.swap_remove(pos);
            }
            if regs.is_empty() {
                self.messenger_registry.remove(room);
            }
            if let Some(indexed) = self.room_index.get_mut(id) {
                indexed.retain(|r| r != room);
                if indexed.is_empty() {
                    self.room_index.remove(id);
                }
            }
        }
    }

    fn snapshot(&self) -> NexusStatus {
        let mut messengers: Vec<String> = self.room_index.keys().cloned().collect();
        messengers.sort();

        let mut messenger_mapping = HashMap::new();
        for (room, regs) in &self.messenger_registry {
            messenger_mapping.insert(room.clone(), regs.iter().map(reg_status).collect());
        }

        NexusStatus {
            hubs: self.hub_registry.iter().map(reg_status).collect(),
            messengers,
            repeaters: self.repeater_registry.iter().map(reg_status).collect(),
            messenger_mapping,
            registration: queue_status(
                "registration",
                self.control_capacity,
                self.control_tx.capacity(),
            ),
            distribution: queue_status(
                "distribution",
                self.distribution_capacity,
                self.distribution_tx.capacity(),
            ),
        }
    }
}

/// Send one wrapper into a registration's channel, waiting out a full
/// buffer.  A dropped receiver just means the endpoint is tearing down and
/// its deregistration hasn't been processed yet.
async fn deliver(reg: &Registration, wrapper: &EventWrapper) {
    if reg.channel.send(wrapper.clone()).await.is_err() {
        debug!(id = %reg.id, "destination gone, deregistration in flight");
    }
}

fn add_to_registry(registry: &mut Vec<Registration>, registration: Registration, t: SourceType) {
    if registry.iter().any(|r| r.id == registration.id) {
        warn!(conn_type = %t, id = %registration.id, "duplicate registration ignored");
        return;
    }
    info!(conn_type = %t, id = %registration.id, "registering connection");
    registry.push(registration);
}

fn remove_from_registry(registry: &mut Vec<Registration>, id: &str, t: SourceType) {
    if let Some(pos) = registry.iter().position(|r| r.id == id) {
        info!(conn_type = %t, id = %id, "removing registration");
        registry.swap_remove(pos);
    } else {
        debug!(conn_type = %t, id = %id, "removal of unknown registration");
    }
}

fn reg_status(reg: &Registration) -> RegStatus {
    RegStatus {
        id: reg.id.clone(),
        buffer_capacity: reg.channel.max_capacity(),
        buffer_utilization: reg.channel.max_capacity() - reg.channel.capacity(),
    }
}

fn queue_status(id: &str, max: usize, free: usize) -> RegStatus {
    RegStatus {
        id: id.to_owned(),
        buffer_capacity: max,
        buffer_utilization: max.saturating_sub(free),
    }
}
