// src/events/tests.rs

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::events::{ActivityEvent, Channel, EventFanout, SubscriberHub, LOG_CHANNEL};
use crate::kv::KvGateway;
use crate::test_utils::{test_record, MockKv};

fn test_event(caller_id: &str) -> ActivityEvent {
    ActivityEvent::from(&test_record(caller_id, 200))
}

#[test]
fn channel_names_parse() {
    assert_eq!(Channel::parse("usage:daily"), Some(Channel::Daily));
    assert_eq!(Channel::parse("usage:top"), Some(Channel::Top));
    assert_eq!(Channel::parse("logs"), Some(Channel::Logs));
    assert_eq!(Channel::parse("bogus"), None);
}

#[tokio::test]
async fn logs_channel_members_receive_dispatches() {
    let hub = Arc::new(SubscriberHub::new());
    let (_watcher, mut watcher_rx) = hub.join("CL-WATCHER", HashSet::from([Channel::Logs]));
    let (_idle, mut idle_rx) = hub.join("CL-IDLE", HashSet::new());

    hub.dispatch_log(&test_event("CL-SOMEONE"));

    let delivered = watcher_rx.recv().await.unwrap();
    assert_eq!(delivered.name, "log:new");
    assert!(delivered.payload.contains("CL-SOMEONE"));

    assert!(
        idle_rx.try_recv().is_err(),
        "a subscriber without the logs channel sees nothing"
    );
}

#[tokio::test]
async fn callers_always_receive_their_own_room() {
    let hub = Arc::new(SubscriberHub::new());
    let (_handle, mut rx) = hub.join("CL-ME", HashSet::new());

    hub.dispatch_log(&test_event("CL-ME"));

    let delivered = rx.recv().await.unwrap();
    assert_eq!(delivered.name, "log:new");
    assert!(delivered.payload.contains("CL-ME"));
}

#[tokio::test]
async fn broadcast_reaches_only_the_channel_members() {
    let hub = Arc::new(SubscriberHub::new());
    let (_daily, mut daily_rx) = hub.join("CL-A", HashSet::from([Channel::Daily]));
    let (_top, mut top_rx) = hub.join("CL-B", HashSet::from([Channel::Top]));

    hub.broadcast(Channel::Daily, "usage:daily:update", "[]");

    assert_eq!(daily_rx.recv().await.unwrap().name, "usage:daily:update");
    assert!(top_rx.try_recv().is_err());
}

#[tokio::test]
async fn membership_can_change_after_connect() {
    let hub = Arc::new(SubscriberHub::new());
    let (handle, mut rx) = hub.join("CL-A", HashSet::new());

    hub.subscribe(handle.id(), Channel::Logs);
    hub.dispatch_log(&test_event("CL-OTHER"));
    assert!(rx.recv().await.is_some());

    hub.unsubscribe(handle.id(), Channel::Logs);
    hub.dispatch_log(&test_event("CL-OTHER"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn dropping_the_handle_releases_the_membership() {
    let hub = Arc::new(SubscriberHub::new());
    let (handle, _rx) = hub.join("CL-A", HashSet::from([Channel::Logs]));
    assert_eq!(hub.subscriber_count(), 1);

    drop(handle);
    assert_eq!(hub.subscriber_count(), 0);
}

#[tokio::test]
async fn close_disconnects_everyone_and_blocks_new_joins() {
    let hub = Arc::new(SubscriberHub::new());
    let (_a, _rx_a) = hub.join("CL-A", HashSet::from([Channel::Logs]));

    hub.close();
    assert_eq!(hub.subscriber_count(), 0);

    let (_b, _rx_b) = hub.join("CL-B", HashSet::from([Channel::Logs]));
    assert_eq!(hub.subscriber_count(), 0, "closed hubs accept nobody");
}

#[tokio::test]
async fn publish_is_fire_and_forget_onto_the_bus() {
    let kv = Arc::new(MockKv::new());
    let hub = Arc::new(SubscriberHub::new());
    let fanout = EventFanout::new(kv.clone() as Arc<dyn KvGateway>, hub);

    fanout.publish(&test_record("CL-A", 200));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let published = kv.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, LOG_CHANNEL);

    let event: ActivityEvent = serde_json::from_str(&published[0].1).unwrap();
    assert_eq!(event.caller_id, "CL-A");
    assert_eq!(event.status, 200);
}

#[tokio::test]
async fn publish_failures_do_not_surface() {
    let kv = Arc::new(MockKv::new());
    kv.set_unavailable(true);
    let fanout = EventFanout::new(kv.clone() as Arc<dyn KvGateway>, Arc::new(SubscriberHub::new()));

    // Must not panic or error; the loss is logged
    fanout.publish(&test_record("CL-A", 200));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(kv.published().is_empty());
}

#[tokio::test]
async fn events_round_trip_from_publish_to_live_subscriber() {
    // One ingestion event reaches the bus and comes back to a connected
    // subscriber on the logs channel
    let kv = Arc::new(MockKv::new());
    let hub = Arc::new(SubscriberHub::new());
    let fanout = Arc::new(EventFanout::new(kv.clone() as Arc<dyn KvGateway>, Arc::clone(&hub)));

    fanout.start_consumer().await.unwrap();
    let (_handle, mut rx) = hub.join("CL-WATCHER", HashSet::from([Channel::Logs]));

    let record = test_record("CL-A", 503);
    fanout.publish(&record);

    let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event should arrive within a second")
        .unwrap();
    assert_eq!(delivered.name, "log:new");

    let event: ActivityEvent = serde_json::from_str(&delivered.payload).unwrap();
    assert_eq!(event.caller_id, "CL-A");
    assert_eq!(event.status, 503);
    assert_eq!(event.endpoint, record.endpoint);
}

#[tokio::test]
async fn undecodable_bus_payloads_are_skipped() {
    let kv = Arc::new(MockKv::new());
    let hub = Arc::new(SubscriberHub::new());
    let fanout = Arc::new(EventFanout::new(kv.clone() as Arc<dyn KvGateway>, Arc::clone(&hub)));

    fanout.start_consumer().await.unwrap();
    let (_handle, mut rx) = hub.join("CL-WATCHER", HashSet::from([Channel::Logs]));

    kv.emit(LOG_CHANNEL, "not json");
    fanout.publish(&test_record("CL-A", 200));

    // The bad payload is dropped, the good one still arrives in order
    let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(delivered.payload.contains("CL-A"));
}
