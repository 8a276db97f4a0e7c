// mock_hub: A mock hub websocket server for testing clients.
//
// Accepts connections on any path, records every binary frame (decoded
// through the codec) and every text frame, and can push frames to all
// connected clients.  Restartable on a fixed port for reconnect tests.

use fabric_protocol::{EventWrapper, SubscriptionChange, parse_message, prepare_message};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

/// A mock hub.  Each test spins up its own isolated instance; dropping the
/// handle (or calling [`MockHub::shutdown`]) severs every client socket.
pub struct MockHub {
    addr: SocketAddr,
    events_rx: Mutex<mpsc::UnboundedReceiver<EventWrapper>>,
    subs_rx: Mutex<mpsc::UnboundedReceiver<SubscriptionChange>>,
    push_tx: broadcast::Sender<EventWrapper>,
    paths: Arc<StdMutex<Vec<String>>>,
    tasks: Arc<StdMutex<Vec<tokio::task::JoinHandle<()>>>>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MockHub {
    /// Start on a random available port.
    pub async fn start() -> Result<Self, std::io::Error> {
        Self::start_on("127.0.0.1:0").await
    }

    /// Start on a specific address.  Used by reconnect tests that need to
    /// bring a hub back on the same port.
    pub async fn start_on(addr: &str) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (subs_tx, subs_rx) = mpsc::unbounded_channel();
        let (push_tx, _) = broadcast::channel(256);
        let paths = Arc::new(StdMutex::new(Vec::new()));
        let tasks = Arc::new(StdMutex::new(Vec::new()));

        let accept_task = {
            let push_tx = push_tx.clone();
            let paths = paths.clone();
            let tasks = tasks.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _peer)) = listener.accept().await else {
                        break;
                    };
                    let events_tx = events_tx.clone();
                    let subs_tx = subs_tx.clone();
                    let push_rx = push_tx.subscribe();
                    let paths = paths.clone();
                    let handle = tokio::spawn(async move {
                        let _ =
                            handle_connection(stream, events_tx, subs_tx, push_rx, paths).await;
                    });
                    tasks.lock().expect("tasks lock").push(handle);
                }
            })
        };

        Ok(MockHub {
            addr,
            events_rx: Mutex::new(events_rx),
            subs_rx: Mutex::new(subs_rx),
            push_tx,
            paths,
            tasks,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The next binary frame any client sent, decoded.
    pub async fn recv_event(&self) -> Option<EventWrapper> {
        self.events_rx.lock().await.recv().await
    }

    /// The next subscription change any client sent.
    pub async fn recv_subscription(&self) -> Option<SubscriptionChange> {
        self.subs_rx.lock().await.recv().await
    }

    /// Push a frame to every connected client.
    pub fn push(&self, wrapper: EventWrapper) {
        let _ = self.push_tx.send(wrapper);
    }

    /// Paths clients connected on, in connection order.
    pub fn connection_paths(&self) -> Vec<String> {
        self.paths.lock().expect("paths lock").clone()
    }

    /// Sever every client and stop accepting.  The port is free afterwards.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        for task in self.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_connection(
    stream: TcpStream,
    events_tx: mpsc::UnboundedSender<EventWrapper>,
    subs_tx: mpsc::UnboundedSender<SubscriptionChange>,
    mut push_rx: broadcast::Receiver<EventWrapper>,
    paths: Arc<StdMutex<Vec<String>>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path_log = paths;
    let callback = move |req: &Request, resp: Response| {
        path_log
            .lock()
            .expect("paths lock")
            .push(req.uri().path().to_owned());
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Binary(b) => {
                        if let Ok(wrapper) = parse_message(&b) {
                            let _ = events_tx.send(wrapper);
                        }
                    }
                    Message::Text(t) => {
                        if let Ok(change) = serde_json::from_str::<SubscriptionChange>(&t) {
                            let _ = subs_tx.send(change);
                        }
                    }
                    Message::Ping(data) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            pushed = push_rx.recv() => {
                match pushed {
                    Ok(wrapper) => {
                        let frame = Message::Binary(prepare_message(&wrapper).into());
                        if write.send(frame).await.is_err() {
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
