//! Hub HTTP surface.
//!
//! - `GET  /connect/:type`          — upgrade a peer websocket
//! - `POST /interconnect/:address`  — dial another hub with retry
//! - `POST /event`                  — fire an event from plain HTTP
//! - `GET  /status`                 — registries + buffer utilisation

use crate::interconnect;
use crate::nexus::Nexus;
use crate::status::HubStatus;
use crate::{config, endpoint};
use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use fabric_protocol::{EventWrapper, SourceType};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub nexus: Nexus,
    pub started: Instant,
}

impl AppState {
    pub fn new(nexus: Nexus) -> AppState {
        AppState {
            nexus,
            started: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/connect/{type}", get(connect_peer))
        .route("/interconnect/{address}", post(create_interconnection))
        .route("/event", post(fire_event))
        .route("/status", get(status))
        .with_state(state)
}

async fn connect_peer(
    ws: WebSocketUpgrade,
    Path(conn_type): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let Ok(conn_type) = conn_type.parse::<SourceType>() else {
        return (StatusCode::BAD_REQUEST, "invalid connection type").into_response();
    };
    ws.on_upgrade(move |socket| endpoint::serve_connection(socket, remote, conn_type, state.nexus))
        .into_response()
}

/// Dial another hub at `ws://<address>:7100/connect/hub`.  The dial retries
/// in the background for the life of the process, so this always accepts.
async fn create_interconnection(
    Path(address): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let addr = format!("{address}:{}", config::DEFAULT_PORT);
    info!(addr = %addr, "interconnect requested");
    tokio::spawn(interconnect::open_connection_with_retry(
        addr,
        "connect/hub".to_owned(),
        SourceType::Hub,
        state.nexus,
    ));
    (StatusCode::OK, "ok").into_response()
}

/// Wrap a posted JSON event with its `affectedRoom.roomID` tag and submit
/// it as if a messenger at the caller's address had published it.
async fn fire_event(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let Some(room) = fabric_protocol::room_of(&body) else {
        return (StatusCode::BAD_REQUEST, "event has no affectedRoom.roomID").into_response();
    };

    let wrapper = EventWrapper::new(room, body.to_vec());
    let id = format!("{remote}messenger");
    match state.nexus.submit(wrapper, SourceType::Messenger, &id).await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            warn!(error = %e, "event submission failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "could not submit event").into_response()
        }
    }
}

async fn status(State(state): State<AppState>) -> Response {
    match state.nexus.status().await {
        Ok(nexus) => Json(HubStatus {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            uptime_seconds: state.started.elapsed().as_secs(),
            nexus,
        })
        .into_response(),
        Err(e) => {
            warn!(error = %e, "status snapshot failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "nexus unavailable").into_response()
        }
    }
}
