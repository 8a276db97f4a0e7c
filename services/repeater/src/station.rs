//! Pumping stations.
//!
//! A station is a short-lived bidirectional session between this repeater
//! and an edge peer.  Either end may initiate the websocket; once it is up,
//! both ends run a read pump, a write pump, a ping pump, and a coordinating
//! pumper.  Only the initiator runs the TTL ticker; the responder relies on
//! the initiator to end the session.
//!
//! The pumper tracks the last activity in each direction; once both sides
//! have been idle past the TTL it closes the session with "going away",
//! deregisters from the repeater's connection map, and lets the peer's
//! in-flight traffic drain before the socket drops.

use crate::repeater::Connections;
use axum::extract::ws::WebSocket;
use fabric_protocol::{EventWrapper, PING_PERIOD, PONG_WAIT, WRITE_WAIT, parse_message, prepare_message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};

/// Internal read/write queue capacity.
pub const STATION_BUFFER: usize = 1024;

/// Inactivity interval after which the initiator closes the session.
pub const TTL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Handle and context
// ---------------------------------------------------------------------------

/// The repeater's handle to one station: an id in the connection map and
/// the session's outbound queue.
#[derive(Debug, Clone)]
pub struct StationHandle {
    pub id: String,
    pub room: String,
    send_tx: mpsc::Sender<EventWrapper>,
}

impl StationHandle {
    /// A handle plus the receiving end of its outbound queue.
    pub fn new_pair(
        id: impl Into<String>,
        room: impl Into<String>,
    ) -> (StationHandle, mpsc::Receiver<EventWrapper>) {
        let (send_tx, send_rx) = mpsc::channel(STATION_BUFFER);
        (
            StationHandle {
                id: id.into(),
                room: room.into(),
                send_tx,
            },
            send_rx,
        )
    }

    pub(crate) fn with_id(mut self, id: String) -> StationHandle {
        self.id = id;
        self
    }

    /// Queue an event for the edge peer.  Waits out a full buffer; a dead
    /// station drops the event (its map entry is already being removed).
    pub async fn send(&self, wrapper: EventWrapper) {
        if self.send_tx.send(wrapper).await.is_err() {
            debug!(id = %self.id, "station gone, dropping event");
        }
    }
}

/// Everything a station needs from its owning repeater.
#[derive(Debug, Clone)]
pub struct StationContext {
    pub connections: Connections,
    /// Inbound events from the peer, drained upstream by the repeater.
    pub receive_tx: mpsc::Sender<EventWrapper>,
    /// This process's device id; used as the caller id when dialling.
    pub system_id: String,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Start an outbound station to `addr` and register it under `target`.
///
/// The returned handle accepts events immediately; they queue while the
/// dial is in flight.  A failed dial deregisters and exits without a socket.
pub async fn start_connection(
    ctx: StationContext,
    target: String,
    room: String,
    addr: String,
) -> StationHandle {
    let (handle, send_rx) = StationHandle::new_pair(target, room.clone());
    let handle = ctx.connections.register(handle).await;

    let station = handle.clone();
    tokio::spawn(async move {
        let url = format!("ws://{}/connect/{}/{}", addr, room, ctx.system_id);
        debug!(id = %station.id, url = %url, "dialling edge peer");
        match connect_async(url.as_str()).await {
            Ok((ws, _resp)) => {
                info!(id = %station.id, "station connected, starting pumps");
                run_station(ws, ctx, station.id.clone(), send_rx, true).await;
            }
            Err(e) => {
                error!(id = %station.id, error = %e, "couldn't open station socket");
                ctx.connections.unregister(&station.id).await;
            }
        }
    });

    handle
}

/// Adopt an incoming station socket from `GET /connect/:room/:id`.
///
/// Runs the session to completion on the caller's task; the responder has
/// no TTL ticker.
pub async fn from_socket(socket: WebSocket, peer_id: String, room: String, ctx: StationContext) {
    let (handle, send_rx) = StationHandle::new_pair(peer_id, room);
    let handle = ctx.connections.register(handle).await;
    info!(id = %handle.id, "incoming station connected");
    run_station(
        crate::ws_compat::AxumWs::new(socket),
        ctx,
        handle.id,
        send_rx,
        false,
    )
    .await;
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ControlFrame {
    Ping,
    Pong(Vec<u8>),
}

async fn run_station<S>(
    socket: S,
    ctx: StationContext,
    id: String,
    mut send_rx: mpsc::Receiver<EventWrapper>,
    ticks: bool,
) where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();

    let (read_q_tx, mut read_q_rx) = mpsc::channel(STATION_BUFFER);
    let (write_q_tx, write_q_rx) = mpsc::channel::<EventWrapper>(STATION_BUFFER);
    let (control_tx, control_rx) = mpsc::channel::<ControlFrame>(8);
    let (error_tx, mut error_rx) = mpsc::channel::<String>(4);

    let (read_exit_tx, read_exit_rx) = watch::channel(false);
    let (write_exit_tx, write_exit_rx) = watch::channel(false);
    let (ping_exit_tx, ping_exit_rx) = watch::channel(false);
    let (confirm_tx, mut confirm_rx) = mpsc::channel::<()>(1);

    let read = tokio::spawn(read_pump(
        stream,
        id.clone(),
        read_q_tx,
        control_tx.clone(),
        error_tx.clone(),
        read_exit_rx,
    ));
    let write = tokio::spawn(write_pump(
        sink,
        id.clone(),
        write_q_rx,
        control_rx,
        error_tx,
        write_exit_rx,
        confirm_tx,
    ));
    let ping = tokio::spawn(ping_pump(control_tx, ping_exit_rx));

    // Pumper: the coordinating loop.  Forwarding refreshes the direction's
    // activity deadline; the ticker (initiator only) ends an idle session.
    let mut read_timeout = Instant::now() + TTL;
    let mut write_timeout = Instant::now() + TTL;
    let mut ticker = tokio::time::interval(TTL);
    ticker.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            _ = ticker.tick(), if ticks => {
                let now = Instant::now();
                if now > read_timeout && now > write_timeout {
                    info!(id = %id, "station idle past TTL, closing");
                    break;
                }
            }
            err = error_rx.recv() => {
                if let Some(err) = err {
                    info!(id = %id, error = %err, "station error, closing");
                }
                break;
            }
            wrapper = send_rx.recv() => {
                let Some(wrapper) = wrapper else { break };
                write_timeout = Instant::now() + TTL;
                if write_q_tx.send(wrapper).await.is_err() {
                    break;
                }
            }
            wrapper = read_q_rx.recv() => {
                let Some(wrapper) = wrapper else { break };
                read_timeout = Instant::now() + TTL;
                if ctx.receive_tx.send(wrapper).await.is_err() {
                    break;
                }
            }
        }
    }

    // Teardown: deregister, stop the pumps, wait for the close frame to be
    // on the wire, then let in-flight peer traffic drain.
    ctx.connections.unregister(&id).await;
    let _ = write_exit_tx.send(true);
    let _ = read_exit_tx.send(true);
    let _ = ping_exit_tx.send(true);
    let _ = tokio::time::timeout(WRITE_WAIT, confirm_rx.recv()).await;

    drop(read_q_rx);
    let _ = write.await;
    let _ = read.await;
    let _ = ping.await;
    tokio::time::sleep(TTL).await;
    debug!(id = %id, "station torn down");
}

async fn read_pump<St>(
    mut stream: St,
    id: String,
    read_q_tx: mpsc::Sender<EventWrapper>,
    control_tx: mpsc::Sender<ControlFrame>,
    error_tx: mpsc::Sender<String>,
    mut exit_rx: watch::Receiver<bool>,
) where
    St: Stream<Item = Result<Message, WsError>> + Unpin + Send,
{
    let mut deadline = Instant::now() + PONG_WAIT;

    loop {
        let msg = tokio::select! {
            msg = tokio::time::timeout_at(deadline, stream.next()) => msg,
            _ = exit_rx.changed() => return,
        };

        match msg {
            Ok(Some(Ok(Message::Binary(b)))) => match parse_message(&b) {
                Ok(wrapper) => {
                    if read_q_tx.send(wrapper).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!(id = %id, error = %e, "badly formed frame from peer"),
            },
            Ok(Some(Ok(Message::Ping(data)))) => {
                let _ = control_tx.send(ControlFrame::Pong(data.to_vec())).await;
            }
            Ok(Some(Ok(Message::Pong(_)))) => {
                deadline = Instant::now() + PONG_WAIT;
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                let _ = error_tx.send("peer closed the session".to_owned()).await;
                return;
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                let _ = error_tx.send(e.to_string()).await;
                return;
            }
            Err(_) => {
                let _ = error_tx.send("read deadline exceeded".to_owned()).await;
                return;
            }
        }
    }
}

async fn write_pump<Si>(
    mut sink: Si,
    id: String,
    mut write_q_rx: mpsc::Receiver<EventWrapper>,
    mut control_rx: mpsc::Receiver<ControlFrame>,
    error_tx: mpsc::Sender<String>,
    mut exit_rx: watch::Receiver<bool>,
    confirm_tx: mpsc::Sender<()>,
) where
    Si: Sink<Message, Error = WsError> + Unpin + Send,
{
    loop {
        tokio::select! {
            wrapper = write_q_rx.recv() => {
                let Some(wrapper) = wrapper else { break };
                let frame = Message::Binary(prepare_message(&wrapper).into());
                if let Err(e) = send_with_deadline(&mut sink, frame).await {
                    let _ = error_tx.send(e).await;
                    break;
                }
            }
            control = control_rx.recv() => {
                let Some(control) = control else { break };
                let frame = match control {
                    ControlFrame::Ping => Message::Ping(Vec::new().into()),
                    ControlFrame::Pong(data) => Message::Pong(data.into()),
                };
                if let Err(e) = send_with_deadline(&mut sink, frame).await {
                    let _ = error_tx.send(e).await;
                    break;
                }
            }
            _ = exit_rx.changed() => {
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "going away".into(),
                }));
                if let Err(e) = send_with_deadline(&mut sink, close).await {
                    debug!(id = %id, error = %e, "close frame not delivered");
                }
                break;
            }
        }
    }

    // Confirm even on error paths so the pumper never waits on a dead pump.
    let _ = confirm_tx.send(()).await;
}

async fn ping_pump(control_tx: mpsc::Sender<ControlFrame>, mut exit_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(PING_PERIOD);
    ticker.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if control_tx.send(ControlFrame::Ping).await.is_err() {
                    return;
                }
            }
            _ = exit_rx.changed() => return,
        }
    }
}

async fn send_with_deadline<Si>(sink: &mut Si, msg: Message) -> Result<(), String>
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    match tokio::time::timeout(WRITE_WAIT, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write timed out".to_owned()),
    }
}
