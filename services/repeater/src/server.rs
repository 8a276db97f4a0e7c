//! Repeater HTTP surface.
//!
//! - `GET  /connect/:room/:id` — accept an incoming pumping-station socket
//! - `POST /send`              — fire an event upstream from plain HTTP
//! - `GET  /status`            — stations, HTTP buffer, upstream state

use crate::http_buffer::{BufferStatus, HttpBuffer};
use crate::repeater::Connections;
use crate::station::{self, StationContext};
use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use fabric_protocol::EventWrapper;
use messenger::Messenger;
use serde::Serialize;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub ctx: StationContext,
    pub connections: Connections,
    pub http_buffer: HttpBuffer,
    pub hub_send: mpsc::Sender<EventWrapper>,
    pub messenger: Messenger,
    pub started: Instant,
}

#[derive(Debug, Serialize)]
pub struct RepeaterStatus {
    pub version: String,
    #[serde(rename = "uptime-seconds")]
    pub uptime_seconds: u64,
    #[serde(rename = "upstream-state")]
    pub upstream_state: String,
    pub stations: Vec<String>,
    #[serde(rename = "http-buffer")]
    pub http_buffer: BufferStatus,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/connect/{room}/{id}", get(connect_station))
        .route("/send", post(fire_event))
        .route("/status", get(status))
        .with_state(state)
}

/// Accept an incoming pumping-station connection.  The session runs on the
/// upgraded socket's task and deregisters itself on exit.
async fn connect_station(
    ws: WebSocketUpgrade,
    Path((room, id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| station::from_socket(socket, id, room, state.ctx))
        .into_response()
}

/// Wrap a posted JSON event and queue it for the hub.
async fn fire_event(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(room) = fabric_protocol::room_of(&body) else {
        return (StatusCode::BAD_REQUEST, "event has no affectedRoom.roomID").into_response();
    };

    let wrapper = EventWrapper::new(room, body.to_vec());
    if state.hub_send.send(wrapper).await.is_err() {
        warn!("hub send buffer is gone");
        return (StatusCode::INTERNAL_SERVER_ERROR, "could not queue event").into_response();
    }
    (StatusCode::OK, "ok").into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    Json(RepeaterStatus {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        uptime_seconds: state.started.elapsed().as_secs(),
        upstream_state: state.messenger.state().to_string(),
        stations: state.connections.ids().await,
        http_buffer: state.http_buffer.status(),
    })
    .into_response()
}
