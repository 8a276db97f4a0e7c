// Messenger behavior against a mock hub: subscription frames, event flow in
// both directions, kill, and reconnect with resubscription.

use fabric_protocol::{EventWrapper, SourceType};
use fabric_test_utils::MockHub;
use messenger::{Messenger, MessengerState};
use std::time::Duration;

fn event(room: &str, body: &str) -> EventWrapper {
    EventWrapper::new(room, body.as_bytes().to_vec())
}

async fn wait_for_state(messenger: &Messenger, state: MessengerState, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if messenger.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("messenger never reached {state:?}, still {:?}", messenger.state());
}

#[tokio::test]
async fn subscribes_and_moves_events_both_ways() {
    let hub = MockHub::start().await.expect("mock hub");
    let messenger = Messenger::connect(hub.local_addr().to_string(), SourceType::Messenger, 64);
    wait_for_state(&messenger, MessengerState::Good, Duration::from_secs(5)).await;

    messenger.subscribe_to_rooms(vec!["ROOM1".to_owned()]).await;
    let change = tokio::time::timeout(Duration::from_secs(5), hub.recv_subscription())
        .await
        .expect("subscription within deadline")
        .expect("hub open");
    assert!(change.create);
    assert_eq!(change.rooms, vec!["ROOM1".to_owned()]);

    // Upstream: a sent event arrives at the hub as a binary frame.
    let out = event("ROOM1", "{\"dir\":\"up\"}");
    messenger.send(out.clone()).await;
    let seen = tokio::time::timeout(Duration::from_secs(5), hub.recv_event())
        .await
        .expect("event within deadline")
        .expect("hub open");
    assert_eq!(seen, out);

    // Downstream: a pushed frame comes out of receive().
    let inbound = event("ROOM1", "{\"dir\":\"down\"}");
    hub.push(inbound.clone());
    let received = tokio::time::timeout(Duration::from_secs(5), messenger.receive())
        .await
        .expect("event within deadline")
        .expect("messenger alive");
    assert_eq!(received, inbound);

    // The connection path names the endpoint type.
    assert_eq!(hub.connection_paths(), vec!["/connect/messenger".to_owned()]);
}

#[tokio::test]
async fn unsubscribe_sends_a_delete_change() {
    let hub = MockHub::start().await.expect("mock hub");
    let messenger = Messenger::connect(hub.local_addr().to_string(), SourceType::Messenger, 64);
    wait_for_state(&messenger, MessengerState::Good, Duration::from_secs(5)).await;

    messenger.subscribe_to_rooms(vec!["ROOM1".to_owned()]).await;
    let first = tokio::time::timeout(Duration::from_secs(5), hub.recv_subscription())
        .await
        .expect("deadline")
        .expect("hub open");
    assert!(first.create);

    messenger.unsubscribe_from_rooms(vec!["ROOM1".to_owned()]).await;
    let second = tokio::time::timeout(Duration::from_secs(5), hub.recv_subscription())
        .await
        .expect("deadline")
        .expect("hub open");
    assert!(!second.create);
    assert_eq!(second.rooms, vec!["ROOM1".to_owned()]);
}

#[tokio::test]
async fn kill_ends_the_connection_promptly() {
    let hub = MockHub::start().await.expect("mock hub");
    let messenger = Messenger::connect(hub.local_addr().to_string(), SourceType::Messenger, 64);
    wait_for_state(&messenger, MessengerState::Good, Duration::from_secs(5)).await;

    messenger.kill();
    wait_for_state(&messenger, MessengerState::Down, Duration::from_secs(5)).await;

    // Subsequent operations return promptly instead of hanging.
    let received = tokio::time::timeout(Duration::from_secs(1), messenger.receive())
        .await
        .expect("receive returns after kill");
    assert!(received.is_none());
    messenger.send(event("ROOM1", "{}")).await;
    messenger.kill(); // idempotent
}

#[tokio::test]
async fn reconnects_and_resubscribes_after_hub_restart() {
    let hub = MockHub::start().await.expect("mock hub");
    let addr = hub.local_addr();
    let messenger = Messenger::connect(addr.to_string(), SourceType::Messenger, 64);
    wait_for_state(&messenger, MessengerState::Good, Duration::from_secs(5)).await;

    messenger.subscribe_to_rooms(vec!["ROOMX".to_owned()]).await;
    let change = tokio::time::timeout(Duration::from_secs(5), hub.recv_subscription())
        .await
        .expect("deadline")
        .expect("hub open");
    assert_eq!(change.rooms, vec!["ROOMX".to_owned()]);

    // Kill the hub process; the messenger goes into retry.
    hub.shutdown();
    drop(hub);
    wait_for_state(&messenger, MessengerState::DownRetrying, Duration::from_secs(10)).await;

    // Bring a hub back on the same port; the messenger re-subscribes on its own.
    let hub = MockHub::start_on(&addr.to_string()).await.expect("restart hub");
    wait_for_state(&messenger, MessengerState::Good, Duration::from_secs(15)).await;

    let change = tokio::time::timeout(Duration::from_secs(10), hub.recv_subscription())
        .await
        .expect("resubscription within deadline")
        .expect("hub open");
    assert!(change.create);
    assert_eq!(change.rooms, vec!["ROOMX".to_owned()]);

    // Delivery works again after the reconnect.
    let inbound = event("ROOMX", "{\"after\":\"restart\"}");
    hub.push(inbound.clone());
    let received = tokio::time::timeout(Duration::from_secs(5), messenger.receive())
        .await
        .expect("deadline")
        .expect("messenger alive");
    assert_eq!(received, inbound);
}
