//! Status surface types for `GET /status`.

use serde::Serialize;
use std::collections::HashMap;

/// Capacity and utilisation of one registration's delivery buffer.
#[derive(Debug, Clone, Serialize)]
pub struct RegStatus {
    pub id: String,
    #[serde(rename = "buffer-capacity")]
    pub buffer_capacity: usize,
    #[serde(rename = "buffer-utilization")]
    pub buffer_utilization: usize,
}

/// State of the routing core: registries and the two inbound queues.
#[derive(Debug, Clone, Serialize)]
pub struct NexusStatus {
    pub hubs: Vec<RegStatus>,
    pub messengers: Vec<String>,
    pub repeaters: Vec<RegStatus>,
    #[serde(rename = "messenger-mapping")]
    pub messenger_mapping: HashMap<String, Vec<RegStatus>>,
    #[serde(rename = "registration-buffer")]
    pub registration: RegStatus,
    #[serde(rename = "distribution-buffer")]
    pub distribution: RegStatus,
}

/// Full hub status: the nexus snapshot plus process-level fields.
#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub version: String,
    #[serde(rename = "uptime-seconds")]
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub nexus: NexusStatus,
}
