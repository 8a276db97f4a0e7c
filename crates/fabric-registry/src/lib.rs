//! Device registry access.
//!
//! The registry is an external service that maps device ids to addresses and
//! answers role queries.  The fabric only depends on the [`DeviceRegistry`]
//! trait; [`HttpRegistry`] talks to a real registry over HTTP and
//! [`MemoryRegistry`] backs tests and development setups.

use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A device record as the registry reports it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Device {
    pub id: String,
    pub address: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Replication state of the registry's local copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationState {
    Completed,
    /// Any state other than `completed`, carried verbatim for logging.
    Pending(String),
}

impl ReplicationState {
    pub fn from_state_str(s: &str) -> Self {
        if s == "completed" {
            ReplicationState::Completed
        } else {
            ReplicationState::Pending(s.to_owned())
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ReplicationState::Completed)
    }
}

/// The `<bldg>-<room>` prefix of a device id, e.g. `ITB-1010-CP1` → `ITB-1010`.
///
/// Device ids are `<bldg>-<room>-<device>`; the first two segments identify
/// the containing room.
pub fn device_room_prefix(id: &str) -> Option<String> {
    let mut parts = id.splitn(3, '-');
    let bldg = parts.next()?;
    let room = parts.next()?;
    if bldg.is_empty() || room.is_empty() {
        return None;
    }
    Some(format!("{bldg}-{room}"))
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("registry request failed: {0}")]
    Request(String),
    #[error("registry response could not be decoded: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// DeviceRegistry trait
// ---------------------------------------------------------------------------

/// Read-only registry queries the fabric needs.
pub trait DeviceRegistry {
    /// Replication state, polled at startup before role queries are trusted.
    fn replication_state(
        &self,
    ) -> impl Future<Output = Result<ReplicationState, RegistryError>> + Send;

    /// Look up a single device by id.
    fn device(&self, id: &str) -> impl Future<Output = Result<Device, RegistryError>> + Send;

    /// All devices carrying `role` with the given device type.
    fn devices_by_role_and_type(
        &self,
        role: &str,
        device_type: &str,
    ) -> impl Future<Output = Result<Vec<Device>, RegistryError>> + Send;
}

/// Poll the registry until replication reports `completed`.
///
/// Never gives up; callers that must not wait gate this behind their own
/// configuration (e.g. `STOP_REPLICATION`).
pub async fn wait_until_ready<R: DeviceRegistry>(registry: &R, poll_interval: Duration) {
    loop {
        match registry.replication_state().await {
            Ok(ReplicationState::Completed) => {
                info!("registry ready");
                return;
            }
            Ok(ReplicationState::Pending(state)) => {
                info!(state = %state, "registry replication incomplete, retrying");
            }
            Err(e) => {
                info!(error = %e, "registry not reachable, retrying");
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
}

// ---------------------------------------------------------------------------
// HttpRegistry
// ---------------------------------------------------------------------------

/// Registry client over HTTP.
///
/// Endpoints: `GET /status` → `{"state": "..."}`,
/// `GET /devices/:id` → device record,
/// `GET /devices?role=R&type=T` → device list.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    state: String,
}

impl HttpRegistry {
    /// `base_url` without a trailing slash, e.g. `http://localhost:7012`.
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpRegistry {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("client builder with static options"),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T, RegistryError> {
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RegistryError::Request(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(url));
        }
        if !resp.status().is_success() {
            return Err(RegistryError::Request(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))
    }
}

impl DeviceRegistry for HttpRegistry {
    async fn replication_state(&self) -> Result<ReplicationState, RegistryError> {
        let body: StatusBody = self.get_json(format!("{}/status", self.base_url)).await?;
        Ok(ReplicationState::from_state_str(&body.state))
    }

    async fn device(&self, id: &str) -> Result<Device, RegistryError> {
        self.get_json(format!("{}/devices/{}", self.base_url, id))
            .await
    }

    async fn devices_by_role_and_type(
        &self,
        role: &str,
        device_type: &str,
    ) -> Result<Vec<Device>, RegistryError> {
        self.get_json(format!(
            "{}/devices?role={}&type={}",
            self.base_url, role, device_type
        ))
        .await
    }
}

// ---------------------------------------------------------------------------
// MemoryRegistry
// ---------------------------------------------------------------------------

/// In-memory registry for tests and development.
///
/// Cloning shares the underlying store; `set_ready(false)` simulates a
/// registry that is still replicating.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    devices: std::sync::RwLock<Vec<Device>>,
    ready: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let reg = MemoryRegistry::default();
        reg.inner.ready.store(true, Ordering::SeqCst);
        reg
    }

    pub fn add_device(&self, device: Device) {
        self.inner
            .devices
            .write()
            .expect("registry lock poisoned")
            .push(device);
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.ready.store(ready, Ordering::SeqCst);
    }
}

impl DeviceRegistry for MemoryRegistry {
    async fn replication_state(&self) -> Result<ReplicationState, RegistryError> {
        if self.inner.ready.load(Ordering::SeqCst) {
            Ok(ReplicationState::Completed)
        } else {
            Ok(ReplicationState::Pending("replicating".to_owned()))
        }
    }

    async fn device(&self, id: &str) -> Result<Device, RegistryError> {
        self.inner
            .devices
            .read()
            .expect("registry lock poisoned")
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))
    }

    async fn devices_by_role_and_type(
        &self,
        role: &str,
        device_type: &str,
    ) -> Result<Vec<Device>, RegistryError> {
        Ok(self
            .inner
            .devices
            .read()
            .expect("registry lock poisoned")
            .iter()
            .filter(|d| d.device_type == device_type && d.roles.iter().any(|r| r == role))
            .cloned()
            .collect())
    }
}
