//! Outbound hub↔hub connections.
//!
//! A hub dials a peer hub's `/connect/hub` endpoint and runs the same
//! two-pump session as an incoming endpoint.  Dials requested through
//! `open_connection_with_retry` are re-established for the life of the
//! process: backoff starts at two seconds and grows by half after every
//! five consecutive failures, capped at two minutes, resetting on success.

use crate::nexus::Nexus;
use fabric_protocol::{
    EventWrapper, PING_PERIOD, PONG_WAIT, SourceType, WRITE_WAIT, parse_message, prepare_message,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(120);
/// Consecutive failures before the backoff grows.
const FAILURES_PER_STEP: u32 = 5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed opening websocket with {addr}: {source}")]
    Dial {
        addr: String,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("nexus rejected the connection: {0}")]
    Register(#[from] crate::nexus::NexusError),
}

/// Dial `ws://addr/path` once, register with the nexus, and run the session
/// in the background.  Leading and trailing `/` on `path` are ignored.
pub async fn open_connection(
    addr: &str,
    path: &str,
    conn_type: SourceType,
    nexus: Nexus,
) -> Result<(), ConnectionError> {
    let (ws, id) = dial(addr, path, conn_type).await?;
    let session = register(&nexus, &id, conn_type).await?;
    tokio::spawn(run_session(ws, session, conn_type, id, nexus));
    Ok(())
}

/// Keep a connection to `addr` alive for the life of the process.
///
/// Never returns an error: dial failures back off and retry, and a session
/// that dies is re-established from scratch.  Callers spawn this.
pub async fn open_connection_with_retry(
    addr: String,
    path: String,
    conn_type: SourceType,
    nexus: Nexus,
) {
    info!(addr = %addr, conn_type = %conn_type, "attempting to open connection");
    let mut backoff = INITIAL_BACKOFF;
    let mut failures: u32 = 0;

    loop {
        match dial(&addr, &path, conn_type).await {
            Ok((ws, id)) => {
                backoff = INITIAL_BACKOFF;
                failures = 0;
                let session = match register(&nexus, &id, conn_type).await {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(id = %id, error = %e, "registration failed");
                        return;
                    }
                };
                run_session(ws, session, conn_type, id, nexus.clone()).await;
                warn!(addr = %addr, "connection lost, re-establishing");
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "dial failed");
                info!(addr = %addr, "connection failed, will retry in {:?}", backoff);
                tokio::time::sleep(backoff).await;
                failures += 1;
                if failures >= FAILURES_PER_STEP {
                    failures = 0;
                    backoff = std::cmp::min(backoff.mul_f64(1.5), MAX_BACKOFF);
                }
            }
        }
    }
}

async fn dial(
    addr: &str,
    path: &str,
    conn_type: SourceType,
) -> Result<(WsStream, String), ConnectionError> {
    let url = format!("ws://{}/{}", addr, path.trim_matches('/'));
    let (ws, _resp) = connect_async(url.as_str())
        .await
        .map_err(|source| ConnectionError::Dial {
            addr: addr.to_owned(),
            source,
        })?;

    // Identify by the resolved remote address when we can see one.
    let remote = match ws.get_ref() {
        MaybeTlsStream::Plain(s) => s
            .peer_addr()
            .map_or_else(|_| addr.to_owned(), |a| a.to_string()),
        _ => addr.to_owned(),
    };
    Ok((ws, format!("{remote}{conn_type}")))
}

struct SessionChannels {
    write_rx: mpsc::Receiver<EventWrapper>,
    write_tx: mpsc::Sender<EventWrapper>,
}

async fn register(
    nexus: &Nexus,
    id: &str,
    conn_type: SourceType,
) -> Result<SessionChannels, crate::nexus::NexusError> {
    let (write_tx, write_rx) = mpsc::channel(crate::endpoint::WRITE_BUFFER);
    nexus
        .register(Vec::new(), write_tx.clone(), id.to_owned(), conn_type)
        .await?;
    Ok(SessionChannels { write_rx, write_tx })
}

/// Run both pumps until the socket dies.  Mirrors the incoming endpoint:
/// the read pump is the only deregistrar.
async fn run_session(
    ws: WsStream,
    session: SessionChannels,
    conn_type: SourceType,
    id: String,
    nexus: Nexus,
) {
    let SessionChannels { write_rx, write_tx } = session;
    drop(write_tx); // outbound peers never subscribe, the nexus holds the rest

    let (sink, stream) = ws.split();
    let (exit_tx, exit_rx) = watch::channel(false);
    let (pong_tx, pong_rx) = mpsc::channel::<Vec<u8>>(8);

    let read = tokio::spawn(read_pump(
        stream,
        nexus,
        conn_type,
        id.clone(),
        pong_tx,
        exit_tx.clone(),
        exit_rx.clone(),
    ));
    write_pump(sink, write_rx, pong_rx, exit_tx, exit_rx, &id).await;
    let _ = read.await;
}

async fn read_pump(
    mut stream: SplitStream<WsStream>,
    nexus: Nexus,
    conn_type: SourceType,
    id: String,
    pong_tx: mpsc::Sender<Vec<u8>>,
    exit_tx: watch::Sender<bool>,
    mut exit_rx: watch::Receiver<bool>,
) {
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
            Message::Ping(data) => {
                let _ = pong_tx.send(data.to_vec()).await;
            }
            Message::Pong(_) => {
                deadline = Instant::now() + PONG_WAIT;
            }
            Message::Close(_) => break,
            // Peer hubs never send meaningful text frames.
            _ => {}
        }
    }

    let _ = nexus.deregister(Vec::new(), conn_type, id).await;
    let _ = exit_tx.send(true);
}

async fn write_pump(
    mut sink: SplitSink<WsStream, Message>,
    mut write_rx: mpsc::Receiver<EventWrapper>,
    mut pong_rx: mpsc::Receiver<Vec<u8>>,
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
                    let _ = send_frame(&mut sink, Message::Close(None), id).await;
                    break;
                };
                let frame = Message::Binary(prepare_message(&wrapper).into());
                if !send_frame(&mut sink, frame, id).await {
                    break;
                }
            }
            data = pong_rx.recv() => {
                let Some(data) = data else { break };
                if !send_frame(&mut sink, Message::Pong(data.into()), id).await {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !send_frame(&mut sink, Message::Ping(Vec::new().into()), id).await {
                    break;
                }
            }
            _ = exit_rx.changed() => {
                let _ = send_frame(&mut sink, Message::Close(None), id).await;
                break;
            }
        }
    }

    let _ = exit_tx.send(true);
}

async fn send_frame(sink: &mut SplitSink<WsStream, Message>, msg: Message, id: &str) -> bool {
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
