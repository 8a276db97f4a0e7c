// Pumping-station sessions: event flow in both directions, the initiator's
// idle-timeout teardown, and responder adoption through the repeater's
// websocket endpoint.

use fabric_protocol::{EventWrapper, prepare_message};
use fabric_test_utils::MockEdgePeer;
use futures_util::SinkExt;
use messenger::Messenger;
use repeater::http_buffer::{self, HttpBuffer};
use repeater::repeater::Connections;
use repeater::server::{self, AppState};
use repeater::station::{self, StationContext};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

fn event(room: &str, body: &str) -> EventWrapper {
    EventWrapper::new(room, body.as_bytes().to_vec())
}

fn context(connections: &Connections) -> (StationContext, mpsc::Receiver<EventWrapper>) {
    let (receive_tx, receive_rx) = mpsc::channel(64);
    (
        StationContext {
            connections: connections.clone(),
            receive_tx,
            system_id: "ITB-1010-CP1".to_owned(),
        },
        receive_rx,
    )
}

async fn wait_until_unregistered(connections: &Connections, id: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if connections.get(id).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("station {id} still registered");
}

#[tokio::test]
async fn station_moves_events_in_both_directions() {
    let peer = MockEdgePeer::start().await.expect("edge peer");
    let connections = Connections::new();
    let (ctx, mut receive_rx) = context(&connections);

    let handle = station::start_connection(
        ctx,
        "PEER1".to_owned(),
        "ITB-1020".to_owned(),
        peer.local_addr().to_string(),
    )
    .await;

    // Outbound: queued events arrive at the edge peer once the dial lands.
    let out = event("ITB-1020", "{\"dir\":\"out\"}");
    handle.send(out.clone()).await;
    let seen = tokio::time::timeout(Duration::from_secs(5), peer.recv_event())
        .await
        .expect("outbound within deadline")
        .expect("peer open");
    assert_eq!(seen, out);

    // Inbound: peer frames land on the repeater's upstream queue.
    let inbound = event("ITB-1020", "{\"dir\":\"in\"}");
    peer.send(inbound.clone());
    let got = tokio::time::timeout(Duration::from_secs(5), receive_rx.recv())
        .await
        .expect("inbound within deadline")
        .expect("context open");
    assert_eq!(got, inbound);
}

#[tokio::test]
async fn idle_initiator_closes_and_deregisters() {
    let peer = MockEdgePeer::start().await.expect("edge peer");
    let connections = Connections::new();
    let (ctx, _receive_rx) = context(&connections);

    let handle = station::start_connection(
        ctx,
        "PEER1".to_owned(),
        "ITB-1020".to_owned(),
        peer.local_addr().to_string(),
    )
    .await;

    // One event, then silence in both directions.
    handle.send(event("ITB-1020", "{}")).await;
    tokio::time::timeout(Duration::from_secs(5), peer.recv_event())
        .await
        .expect("outbound within deadline")
        .expect("peer open");

    // Two TTL ticks later the initiator closes with "going away".
    tokio::time::timeout(Duration::from_secs(15), peer.closed())
        .await
        .expect("initiator should close an idle session");
    wait_until_unregistered(&connections, "PEER1", Duration::from_secs(5)).await;
}

#[tokio::test]
async fn failed_dial_deregisters_without_a_socket() {
    let connections = Connections::new();
    let (ctx, _receive_rx) = context(&connections);

    // Nothing listens here; the dial fails fast.
    let _handle = station::start_connection(
        ctx,
        "PEER1".to_owned(),
        "ITB-1020".to_owned(),
        "127.0.0.1:1".to_owned(),
    )
    .await;

    wait_until_unregistered(&connections, "PEER1", Duration::from_secs(10)).await;
}

#[tokio::test]
async fn responder_adopts_incoming_stations_and_forwards_upstream() {
    let connections = Connections::new();
    let (ctx, mut receive_rx) = context(&connections);

    // A repeater surface with an upstream messenger that never connects;
    // only the station endpoint matters here.
    let state = AppState {
        ctx: ctx.clone(),
        connections: connections.clone(),
        http_buffer: HttpBuffer::start(http_buffer::REQUEST_TIMEOUT, 16),
        hub_send: ctx.receive_tx.clone(),
        messenger: Messenger::connect(
            "127.0.0.1:9",
            fabric_protocol::SourceType::Repeater,
            16,
        ),
        started: Instant::now(),
    };
    let router = server::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let (mut ws, _) = connect_async(format!("ws://{addr}/connect/ITB-1020/EDGE-CP7"))
        .await
        .expect("connect");

    // The station registers under the caller's id.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if connections.get("EDGE-CP7").await.is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "station never registered");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Frames we send land on the repeater's upstream queue.
    let inbound = event("ITB-1020", "{\"from\":\"edge\"}");
    ws.send(Message::Binary(prepare_message(&inbound).into()))
        .await
        .expect("send frame");
    let got = tokio::time::timeout(Duration::from_secs(5), receive_rx.recv())
        .await
        .expect("inbound within deadline")
        .expect("context open");
    assert_eq!(got, inbound);

    // Closing our end tears the responder down and clears the map entry.
    ws.send(Message::Close(None)).await.expect("close");
    drop(ws);
    wait_until_unregistered(&connections, "EDGE-CP7", Duration::from_secs(15)).await;
}
