//! Incoming peer connection endpoints.
//!
//! One endpoint wraps one upgraded websocket and runs two pumps: the read
//! pump parses inbound frames and feeds the nexus, the write pump owns the
//! socket sink, drains the endpoint's delivery buffer, and pings the peer.
//! The read pump is the only place the endpoint deregisters, so teardown
//! happens exactly once no matter which pump dies first.

use crate::nexus::Nexus;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use fabric_protocol::{
    EventWrapper, PING_PERIOD, PONG_WAIT, SourceType, SubscriptionChange, WRITE_WAIT,
    parse_message, prepare_message,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Delivery buffer between the nexus and this endpoint's write pump.
pub const WRITE_BUFFER: usize = 1000;

/// Run an upgraded peer connection to completion.
///
/// Registers with the nexus with no rooms (messengers subscribe via text
/// frames), then pumps until the socket dies or the peer leaves.
pub async fn serve_connection(
    socket: WebSocket,
    remote: SocketAddr,
    conn_type: SourceType,
    nexus: Nexus,
) {
    let id = format!("{remote}{conn_type}");
    let (write_tx, write_rx) = mpsc::channel(WRITE_BUFFER);

    if let Err(e) = nexus
        .register(Vec::new(), write_tx.clone(), id.clone(), conn_type)
        .await
    {
        warn!(id = %id, error = %e, "could not register connection");
        return;
    }
    info!(id = %id, conn_type = %conn_type, "peer connected");

    let (sink, stream) = socket.split();
    let (exit_tx, exit_rx) = watch::channel(false);

    let read = tokio::spawn(read_pump(
        stream,
        nexus,
        conn_type,
        id.clone(),
        write_tx,
        exit_tx.clone(),
        exit_rx.clone(),
    ));
    write_pump(sink, write_rx, exit_tx, exit_rx, &id).await;
    let _ = read.await;
    info!(id = %id, "peer connection closed");
}

/// Read pump: binary frames are events, text frames are subscription
/// changes (honoured from messengers only).  Deregisters on exit.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    nexus: Nexus,
    conn_type: SourceType,
    id: String,
    write_tx: mpsc::Sender<EventWrapper>,
    exit_tx: watch::Sender<bool>,
    mut exit_rx: watch::Receiver<bool>,
) {
    // Extended only by pongs; the write pump pings every PING_PERIOD.
    let mut deadline = Instant::now() + PONG_WAIT;

    loop {
        let msg = tokio::select! {
            msg = tokio::time::timeout_at(deadline, stream.next()) => msg,
            _ = exit_rx.changed() => break,
        };

        let msg = match msg {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                warn!(id = %id, error = %e, "read pump socket error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(id = %id, "no pong within {:?}", PONG_WAIT);
                break;
            }
        };

        match msg {
            Message::Binary(b) => match parse_message(&b) {
                Ok(wrapper) => {
                    if let Err(e) = nexus.submit(wrapper, conn_type, &id).await {
                        warn!(id = %id, error = %e, "submit failed");
                    }
                }
                Err(e) => warn!(id = %id, error = %e, "badly formed event frame"),
            },
            Message::Text(t) if conn_type == SourceType::Messenger => {
                let change: SubscriptionChange = match serde_json::from_str(&t) {
                    Ok(change) => change,
                    Err(e) => {
                        warn!(id = %id, error = %e, "invalid subscription change");
                        continue;
                    }
                };
                // The wire is never trusted for identity: the change is
                // applied with this endpoint's own id and channel.
                let result = if change.create {
                    nexus
                        .register(
                            change.rooms,
                            write_tx.clone(),
                            id.clone(),
                            SourceType::Messenger,
                        )
                        .await
                } else {
                    nexus
                        .deregister(change.rooms, SourceType::Messenger, id.clone())
                        .await
                };
                if let Err(e) = result {
                    warn!(id = %id, error = %e, "subscription change failed");
                }
            }
            Message::Text(_) => {
                debug!(id = %id, "text frame from non-messenger peer ignored");
            }
            Message::Pong(_) => {
                deadline = Instant::now() + PONG_WAIT;
            }
            // Pings are answered by the websocket layer.
            Message::Ping(_) => {}
            Message::Close(_) => break,
        }
    }

    let _ = nexus.deregister(Vec::new(), conn_type, id).await;
    let _ = exit_tx.send(true);
}

/// Write pump: owns the sink.  Encodes delivery-buffer wrappers as binary
/// frames and pings on a ticker; sends a close frame on the way out.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut write_rx: mpsc::Receiver<EventWrapper>,
    exit_tx: watch::Sender<bool>,
    mut exit_rx: watch::Receiver<bool>,
    id: &str,
) {
    let mut ticker = tokio::time::interval(PING_PERIOD);
    ticker.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            wrapper = write_rx.recv() => {
                let Some(wrapper) = wrapper else {
                    let _ = send_frame(&mut sink, close_frame(), id).await;
                    break;
                };
                let frame = Message::Binary(prepare_message(&wrapper).into());
                if !send_frame(&mut sink, frame, id).await {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !send_frame(&mut sink, Message::Ping(Vec::new().into()), id).await {
                    break;
                }
            }
            _ = exit_rx.changed() => {
                let _ = send_frame(&mut sink, close_frame(), id).await;
                break;
            }
        }
    }

    let _ = exit_tx.send(true);
}

fn close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "".into(),
    }))
}

async fn send_frame(sink: &mut SplitSink<WebSocket, Message>, msg: Message, id: &str) -> bool {
    match tokio::time::timeout(WRITE_WAIT, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(id = %id, error = %e, "write pump socket error");
            false
        }
        Err(_) => {
            warn!(id = %id, "write timed out");
            false
        }
    }
}
