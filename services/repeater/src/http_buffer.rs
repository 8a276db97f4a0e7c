//! Outbound HTTP delivery.
//!
//! Some targets only accept plain HTTP; their events queue here and a
//! single worker posts them with a short per-request timeout.  Failures and
//! non-2xx responses are logged and skipped, never retried.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Queue capacity before senders block.
pub const BUFFER_SIZE: usize = 1000;

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct OutboundRequest {
    event: Vec<u8>,
    method: String,
    address: String,
}

/// Capacity and utilisation, for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    #[serde(rename = "buffer-cap")]
    pub buffer_cap: usize,
    #[serde(rename = "buffer-util")]
    pub buffer_util: usize,
}

/// Handle to the delivery worker.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpBuffer {
    tx: mpsc::Sender<OutboundRequest>,
}

impl HttpBuffer {
    /// Start the worker with the given per-request timeout and queue size.
    pub fn start(timeout: Duration, buffer_size: usize) -> HttpBuffer {
        let (tx, rx) = mpsc::channel(buffer_size);
        tokio::spawn(run(rx, timeout));
        HttpBuffer { tx }
    }

    /// Queue one request.  Blocks while the buffer is full.
    pub async fn send(&self, event: Vec<u8>, method: &str, address: &str) {
        let request = OutboundRequest {
            event,
            method: method.to_owned(),
            address: address.to_owned(),
        };
        if self.tx.send(request).await.is_err() {
            error!("http buffer worker is gone, dropping event");
        }
    }

    pub fn status(&self) -> BufferStatus {
        BufferStatus {
            buffer_cap: self.tx.max_capacity(),
            buffer_util: self.tx.max_capacity() - self.tx.capacity(),
        }
    }
}

async fn run(mut rx: mpsc::Receiver<OutboundRequest>, timeout: Duration) {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "could not build http client, buffer disabled");
            return;
        }
    };

    while let Some(request) = rx.recv().await {
        debug!(addr = %request.address, method = %request.method, "sending event");

        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(method) => method,
            Err(e) => {
                error!(method = %request.method, error = %e, "invalid method");
                continue;
            }
        };

        let response = client
            .request(method, &request.address)
            .header("Content-Type", "application/json")
            .body(request.event)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                debug!(addr = %request.address, status = %resp.status(), "event delivered");
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                warn!(addr = %request.address, status = %status, body = %body, "non-2xx response");
            }
            Err(e) => {
                error!(addr = %request.address, error = %e, "couldn't send event");
            }
        }
    }
}
