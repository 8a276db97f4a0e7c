// mock_edge_peer: A mock edge device for pumping-station tests.
//
// Accepts station connections, records decoded frames, can send frames
// back, and reports when the far end closed the session.

use fabric_protocol::{EventWrapper, parse_message, prepare_message};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;

/// A mock edge peer.  Binds a random port; every accepted connection shares
/// the same record/send channels, so tests usually accept exactly one.
pub struct MockEdgePeer {
    addr: SocketAddr,
    events_rx: Mutex<mpsc::UnboundedReceiver<EventWrapper>>,
    send_tx: broadcast::Sender<EventWrapper>,
    closed_rx: watch::Receiver<bool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MockEdgePeer {
    pub async fn start() -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (send_tx, _) = broadcast::channel(64);
        let (closed_tx, closed_rx) = watch::channel(false);

        let accept_task = {
            let send_tx = send_tx.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _peer)) = listener.accept().await else {
                        break;
                    };
                    let events_tx = events_tx.clone();
                    let send_rx = send_tx.subscribe();
                    let closed_tx = closed_tx.clone();
                    tokio::spawn(async move {
                        let _ = handle_connection(stream, events_tx, send_rx, closed_tx).await;
                    });
                }
            })
        };

        Ok(MockEdgePeer {
            addr,
            events_rx: Mutex::new(events_rx),
            send_tx,
            closed_rx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The next frame the station delivered, decoded.
    pub async fn recv_event(&self) -> Option<EventWrapper> {
        self.events_rx.lock().await.recv().await
    }

    /// Send a frame to every connected station.
    pub fn send(&self, wrapper: EventWrapper) {
        let _ = self.send_tx.send(wrapper);
    }

    /// Resolves once a station has closed (close frame or socket drop).
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Drop for MockEdgePeer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    events_tx: mpsc::UnboundedSender<EventWrapper>,
    mut send_rx: broadcast::Receiver<EventWrapper>,
    closed_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(b))) => {
                        if let Ok(wrapper) = parse_message(&b) {
                            let _ = events_tx.send(wrapper);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        let _ = closed_tx.send(true);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            outbound = send_rx.recv() => {
                match outbound {
                    Ok(wrapper) => {
                        let frame = Message::Binary(prepare_message(&wrapper).into());
                        if write.send(frame).await.is_err() {
                            let _ = closed_tx.send(true);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}
