//! Client-side endpoint for the event fabric.
//!
//! A [`Messenger`] holds one long-lived websocket to a hub's
//! `/connect/:type` endpoint and survives hub restarts: on socket failure
//! both pumps are joined, the dial is retried every three seconds, and every
//! room in the local subscription set is re-sent once the socket is back.
//! The handle stays valid to callers throughout.
//!
//! Binary frames carry encoded events; text frames carry one JSON-encoded
//! subscription change.

use fabric_protocol::{
    EventWrapper, PING_WAIT, SourceType, SubscriptionChange, WRITE_WAIT, parse_message,
    prepare_message,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

/// Interval to wait between reconnect attempts.
const RETRY_INTERVAL: Duration = Duration::from_secs(3);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// MessengerState
// ---------------------------------------------------------------------------

/// Connection state, surfaced through status endpoints only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerState {
    Good,
    Down,
    DownRetrying,
}

impl fmt::Display for MessengerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessengerState::Good => f.write_str("good"),
            MessengerState::Down => f.write_str("down"),
            MessengerState::DownRetrying => f.write_str("down retrying"),
        }
    }
}

// ---------------------------------------------------------------------------
// Messenger
// ---------------------------------------------------------------------------

/// Handle to a hub connection.  Cheap to clone; all clones share the same
/// socket, queues, and subscription set.
#[derive(Clone)]
pub struct Messenger {
    write_tx: mpsc::Sender<EventWrapper>,
    sub_tx: mpsc::Sender<SubscriptionChange>,
    read_rx: Arc<Mutex<mpsc::Receiver<EventWrapper>>>,
    rooms: Arc<Mutex<HashSet<String>>>,
    state_rx: watch::Receiver<MessengerState>,
    kill_tx: watch::Sender<bool>,
}

impl Messenger {
    /// Open a connection to `hub_address` as the given endpoint type.
    ///
    /// Always returns a usable handle: when the first dial fails the
    /// messenger comes back in `DownRetrying` state with the reconnector
    /// already running.
    pub fn connect(
        hub_address: impl Into<String>,
        connection_type: SourceType,
        buffer_size: usize,
    ) -> Messenger {
        let hub_address = hub_address.into();
        let (write_tx, write_rx) = mpsc::channel(buffer_size);
        let (sub_tx, sub_rx) = mpsc::channel(64);
        let (read_tx, read_rx) = mpsc::channel(buffer_size);
        let (state_tx, state_rx) = watch::channel(MessengerState::DownRetrying);
        let (kill_tx, kill_rx) = watch::channel(false);
        let rooms = Arc::new(Mutex::new(HashSet::new()));

        tokio::spawn(supervisor(
            hub_address,
            connection_type,
            write_rx,
            sub_rx,
            read_tx,
            state_tx,
            kill_rx,
            rooms.clone(),
        ));

        Messenger {
            write_tx,
            sub_tx,
            read_rx: Arc::new(Mutex::new(read_rx)),
            rooms,
            state_rx,
            kill_tx,
        }
    }

    /// Queue an event for delivery to the hub.
    ///
    /// Waits for queue capacity, not for delivery.  After [`kill`] the
    /// event is dropped.
    ///
    /// [`kill`]: Messenger::kill
    pub async fn send(&self, wrapper: EventWrapper) {
        if self.write_tx.send(wrapper).await.is_err() {
            debug!("send after kill, dropping event");
        }
    }

    /// The next event from the hub, or `None` once the connection has been
    /// killed.
    pub async fn receive(&self) -> Option<EventWrapper> {
        self.read_rx.lock().await.recv().await
    }

    /// Subscribe to every room in `rooms` and remember them for
    /// resubscription after a reconnect.
    pub async fn subscribe_to_rooms(&self, rooms: Vec<String>) {
        {
            let mut set = self.rooms.lock().await;
            for room in &rooms {
                set.insert(room.clone());
            }
        }
        let change = SubscriptionChange {
            rooms,
            create: true,
        };
        if self.sub_tx.send(change).await.is_err() {
            debug!("subscribe after kill, dropping change");
        }
    }

    /// Unsubscribe from every room in `rooms`.
    pub async fn unsubscribe_from_rooms(&self, rooms: Vec<String>) {
        {
            let mut set = self.rooms.lock().await;
            for room in &rooms {
                set.remove(room);
            }
        }
        let change = SubscriptionChange {
            rooms,
            create: false,
        };
        if self.sub_tx.send(change).await.is_err() {
            debug!("unsubscribe after kill, dropping change");
        }
    }

    /// Close the connection.  Idempotent; pending and subsequent operations
    /// return promptly.
    pub fn kill(&self) {
        let _ = self.kill_tx.send(true);
    }

    /// Current connection state.
    pub fn state(&self) -> MessengerState {
        *self.state_rx.borrow()
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns the socket lifecycle: dial, run both pumps, join them on failure,
/// redial, resubscribe.  Exits only on kill.
#[allow(clippy::too_many_arguments)]
async fn supervisor(
    hub_address: String,
    connection_type: SourceType,
    mut write_rx: mpsc::Receiver<EventWrapper>,
    mut sub_rx: mpsc::Receiver<SubscriptionChange>,
    read_tx: mpsc::Sender<EventWrapper>,
    state_tx: watch::Sender<MessengerState>,
    mut kill_rx: watch::Receiver<bool>,
    rooms: Arc<Mutex<HashSet<String>>>,
) {
    let url = connect_url(&hub_address, connection_type);

    loop {
        let ws = match dial(&url, &state_tx, &mut kill_rx).await {
            Some(ws) => ws,
            None => break, // killed while dialing
        };

        let _ = state_tx.send(MessengerState::Good);
        info!(hub = %hub_address, "connected to hub, starting pumps");

        let (mut sink, stream) = ws.split();

        // Re-send the full subscription set before events start flowing.
        if !resubscribe(&mut sink, &rooms).await {
            let _ = state_tx.send(MessengerState::DownRetrying);
            tokio::time::sleep(RETRY_INTERVAL).await;
            continue;
        }

        // Either pump signals here on exit so the other never hangs on a
        // dead socket.
        let (exit_tx, exit_rx) = watch::channel(false);
        let (pong_tx, pong_rx) = mpsc::channel::<Vec<u8>>(8);

        let read_handle = tokio::spawn(read_pump(
            stream,
            read_tx.clone(),
            pong_tx,
            exit_tx.clone(),
            exit_rx.clone(),
            kill_rx.clone(),
        ));
        let write_handle = tokio::spawn(write_pump(
            sink,
            write_rx,
            sub_rx,
            pong_rx,
            exit_tx,
            exit_rx,
            kill_rx.clone(),
        ));

        let _ = read_handle.await;
        let Ok((w, s)) = write_handle.await else {
            error!("write pump panicked, messenger dead");
            let _ = state_tx.send(MessengerState::Down);
            return;
        };
        write_rx = w;
        sub_rx = s;

        if *kill_rx.borrow() {
            let _ = state_tx.send(MessengerState::Down);
            info!(hub = %hub_address, "messenger killed");
            return;
        }

        warn!(hub = %hub_address, "connection to hub lost, retrying");
        let _ = state_tx.send(MessengerState::DownRetrying);
        tokio::time::sleep(RETRY_INTERVAL).await;
    }

    let _ = state_tx.send(MessengerState::Down);
}

fn connect_url(hub_address: &str, connection_type: SourceType) -> String {
    let base = hub_address.trim_end_matches('/');
    if base.starts_with("ws://") || base.starts_with("wss://") {
        format!("{base}/connect/{connection_type}")
    } else {
        format!("ws://{base}/connect/{connection_type}")
    }
}

/// Dial until success or kill.  Returns `None` when killed.
async fn dial(
    url: &str,
    state_tx: &watch::Sender<MessengerState>,
    kill_rx: &mut watch::Receiver<bool>,
) -> Option<WsStream> {
    loop {
        if *kill_rx.borrow() {
            return None;
        }
        match connect_async(url).await {
            Ok((ws, _resp)) => return Some(ws),
            Err(e) => {
                let _ = state_tx.send(MessengerState::DownRetrying);
                warn!(url = %url, error = %e, "dial failed, retrying in {:?}", RETRY_INTERVAL);
                tokio::select! {
                    () = tokio::time::sleep(RETRY_INTERVAL) => {}
                    _ = kill_rx.changed() => {}
                }
            }
        }
    }
}

async fn resubscribe(
    sink: &mut SplitSink<WsStream, Message>,
    rooms: &Arc<Mutex<HashSet<String>>>,
) -> bool {
    let set: Vec<String> = rooms.lock().await.iter().cloned().collect();
    if set.is_empty() {
        return true;
    }
    let change = SubscriptionChange {
        rooms: set,
        create: true,
    };
    let json = match serde_json::to_string(&change) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "could not encode subscription change");
            return true;
        }
    };
    match tokio::time::timeout(WRITE_WAIT, sink.send(Message::Text(json.into()))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "resubscribe write failed");
            false
        }
        Err(_) => {
            warn!("resubscribe write timed out");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

/// Read pump: parses binary frames onto the read queue, answers hub pings
/// through the write pump, and signals the write pump on exit.
async fn read_pump(
    mut stream: SplitStream<WsStream>,
    read_tx: mpsc::Sender<EventWrapper>,
    pong_tx: mpsc::Sender<Vec<u8>>,
    exit_tx: watch::Sender<bool>,
    mut exit_rx: watch::Receiver<bool>,
    mut kill_rx: watch::Receiver<bool>,
) {
    // The hub pings every PING_PERIOD; the deadline is refreshed on each one.
    let mut deadline = Instant::now() + PING_WAIT;

    loop {
        let msg = tokio::select! {
            msg = tokio::time::timeout_at(deadline, stream.next()) => msg,
            _ = exit_rx.changed() => break,
            _ = kill_rx.changed() => break,
        };

        let msg = match msg {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                warn!(error = %e, "read pump socket error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("no ping from hub within {:?}", PING_WAIT);
                break;
            }
        };

        match msg {
            Message::Binary(b) => match parse_message(&b) {
                Ok(wrapper) => {
                    if read_tx.send(wrapper).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "poorly formed frame from hub"),
            },
            Message::Ping(data) => {
                deadline = Instant::now() + PING_WAIT;
                let _ = pong_tx.send(data.to_vec()).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    let _ = exit_tx.send(true);
}

/// Write pump: owns the socket sink.  Encodes events as binary frames,
/// subscription changes as text frames, and pong replies for the read pump.
/// Returns the queue receivers so the supervisor can reuse them after a
/// reconnect.
async fn write_pump(
    mut sink: SplitSink<WsStream, Message>,
    mut write_rx: mpsc::Receiver<EventWrapper>,
    mut sub_rx: mpsc::Receiver<SubscriptionChange>,
    mut pong_rx: mpsc::Receiver<Vec<u8>>,
    exit_tx: watch::Sender<bool>,
    mut exit_rx: watch::Receiver<bool>,
    mut kill_rx: watch::Receiver<bool>,
) -> (mpsc::Receiver<EventWrapper>, mpsc::Receiver<SubscriptionChange>) {
    loop {
        tokio::select! {
            wrapper = write_rx.recv() => {
                let Some(wrapper) = wrapper else { break };
                let frame = Message::Binary(prepare_message(&wrapper).into());
                if !write_with_deadline(&mut sink, frame).await {
                    break;
                }
            }
            change = sub_rx.recv() => {
                let Some(change) = change else { break };
                let Ok(json) = serde_json::to_string(&change) else { continue };
                if !write_with_deadline(&mut sink, Message::Text(json.into())).await {
                    break;
                }
            }
            data = pong_rx.recv() => {
                // A closed pong channel means the read pump is gone.
                let Some(data) = data else {
                    let _ = write_with_deadline(&mut sink, close_frame()).await;
                    break;
                };
                if !write_with_deadline(&mut sink, Message::Pong(data.into())).await {
                    break;
                }
            }
            _ = exit_rx.changed() => {
                let _ = write_with_deadline(&mut sink, close_frame()).await;
                break;
            }
            _ = kill_rx.changed() => {
                let _ = write_with_deadline(&mut sink, close_frame()).await;
                break;
            }
        }
    }

    let _ = exit_tx.send(true);
    (write_rx, sub_rx)
}

fn close_frame() -> Message {
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }))
}

async fn write_with_deadline(sink: &mut SplitSink<WsStream, Message>, msg: Message) -> bool {
    match tokio::time::timeout(WRITE_WAIT, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "problem writing message to socket");
            false
        }
        Err(_) => {
            warn!("write timed out");
            false
        }
    }
}
