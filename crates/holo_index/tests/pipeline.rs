//! End-to-end behavior of publish, consume and catch-up on one node.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use holo_index::{
    ConsumerState, EventKind, EventRecord, FanOut, IndexError, IndexQueue, MembershipEvent,
    MembershipSubscriber,
};

use common::{
    open_queue, test_config, wait_until, FlakyIndex, GatedIndex, RecordingIndex, LOCAL_NODE,
};

fn go_live(queue: &IndexQueue) {
    queue.on_membership_event(&MembershipEvent::Joined(LOCAL_NODE));
}

#[test]
fn two_rows_are_applied_in_order_and_catch_up_blocks_for_the_third() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(dir.path());

    assert_eq!(queue.publish("rowA", "P1").unwrap(), 1);
    assert_eq!(queue.publish("rowB", "P2").unwrap(), 2);

    let index = RecordingIndex::new("by_row");
    assert!(queue.register(index.clone()));
    go_live(&queue);

    queue
        .catch_up_timeout(2, common::WAIT_TIMEOUT)
        .expect("consumer caught up");
    assert_eq!(index.keys(), vec![b"rowA".to_vec(), b"rowB".to_vec()]);
    assert_eq!(queue.read_generation(), 2);
    assert!(queue.read_generation() <= queue.write_generation());

    // Already reached: returns without waiting.
    queue.catch_up(2);
    queue.catch_up(0);

    let waiter = {
        let queue = queue.clone();
        thread::spawn(move || {
            queue.catch_up(3);
            queue.read_generation()
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    assert_eq!(queue.publish("rowC", "P3").unwrap(), 3);
    assert_eq!(waiter.join().unwrap(), 3);
    assert_eq!(index.count(), 3);
    queue.shutdown().unwrap();
}

#[test]
fn empty_key_is_rejected_and_write_generation_is_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(dir.path());
    queue.publish("rowA", "P1").unwrap();

    let err = queue.publish(Vec::<u8>::new(), "P").unwrap_err();
    assert!(matches!(err, IndexError::InvalidArgument(_)));
    let err = queue.publish_delete("").unwrap_err();
    assert!(matches!(err, IndexError::InvalidArgument(_)));

    assert_eq!(queue.write_generation(), 1);
    assert_eq!(queue.pending(), 1);
}

#[test]
fn never_started_consumer_applies_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(dir.path());
    let index = RecordingIndex::new("idle");
    queue.register(index.clone());
    queue.publish("rowA", "P1").unwrap();
    queue.publish("rowB", "P2").unwrap();

    thread::sleep(Duration::from_millis(50));
    assert_eq!(queue.consumer_state(), ConsumerState::Stopped);
    assert_eq!(index.count(), 0);
    assert_eq!(queue.read_generation(), 0);
    assert!(matches!(
        queue.catch_up_timeout(1, Duration::from_millis(20)),
        Err(IndexError::CatchUpTimeout { target: 1, read_generation: 0 })
    ));
}

#[test]
fn register_on_live_node_starts_the_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(dir.path());
    go_live(&queue);
    assert!(queue.lifecycle().is_live());
    assert_eq!(queue.consumer_state(), ConsumerState::Stopped);

    queue.publish("rowA", "P1").unwrap();
    let index = RecordingIndex::new("late");
    assert!(queue.register(index.clone()));
    assert_eq!(queue.consumer_state(), ConsumerState::Running);
    queue.catch_up_timeout(1, common::WAIT_TIMEOUT).unwrap();
    assert_eq!(index.keys(), vec![b"rowA".to_vec()]);
}

#[test]
fn local_death_stops_application_until_rejoin() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(dir.path());
    let index = RecordingIndex::new("by_row");
    queue.register(index.clone());
    go_live(&queue);

    queue.publish("rowA", "P1").unwrap();
    queue.catch_up_timeout(1, common::WAIT_TIMEOUT).unwrap();

    queue.on_membership_event(&MembershipEvent::Dead(LOCAL_NODE));
    assert!(wait_until(|| queue.consumer_state() == ConsumerState::Stopped));

    queue.publish("rowB", "P2").unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(index.keys(), vec![b"rowA".to_vec()]);
    assert_eq!(queue.read_generation(), 1);

    // Notifications about other nodes do not restart it.
    queue.on_membership_event(&MembershipEvent::Joined(LOCAL_NODE + 1));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(index.count(), 1);

    queue.on_membership_event(&MembershipEvent::TokensChanged(LOCAL_NODE));
    queue.catch_up_timeout(2, common::WAIT_TIMEOUT).unwrap();
    assert_eq!(index.keys(), vec![b"rowA".to_vec(), b"rowB".to_vec()]);
}

#[test]
fn duplicate_registration_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(dir.path());
    let first = RecordingIndex::new("users_by_email");
    let second = RecordingIndex::new("users_by_email");
    assert!(queue.register(first.clone()));
    assert!(!queue.register(second.clone()));
    assert_eq!(queue.list_indexes(), vec!["users_by_email".to_string()]);

    go_live(&queue);
    queue.publish("rowA", "P1").unwrap();
    queue.catch_up_timeout(1, common::WAIT_TIMEOUT).unwrap();
    assert_eq!(first.count(), 1);
    assert_eq!(second.count(), 0);
    assert_eq!(queue.index_size("users_by_email"), Some(1));
    assert_eq!(queue.index_size("missing"), None);
    assert_eq!(queue.index_shards("users_by_email"), None);
}

#[test]
fn failing_index_is_retried_until_it_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(dir.path());
    let flaky = FlakyIndex::new("flaky", 5);
    let steady = RecordingIndex::new("steady");
    queue.register(flaky.clone());
    queue.register(steady.clone());
    go_live(&queue);

    queue.publish("rowA", "P1").unwrap();
    queue.publish("rowB", "P2").unwrap();
    queue.catch_up_timeout(2, common::WAIT_TIMEOUT).unwrap();

    assert_eq!(flaky.calls(), 7);
    assert_eq!(flaky.keys(), vec![b"rowA".to_vec(), b"rowB".to_vec()]);
    assert_eq!(steady.keys(), vec![b"rowA".to_vec(), b"rowB".to_vec()]);
    assert_eq!(queue.consumer().applied_events(), 2);
}

#[test]
fn by_source_fan_out_routes_tagged_events() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.fan_out = FanOut::BySource;
    let queue = IndexQueue::open(cfg).unwrap();

    let users = RecordingIndex::for_source("users_by_email", "users");
    let orders = RecordingIndex::for_source("orders_by_day", "orders");
    queue.register(users.clone());
    queue.register(orders.clone());
    go_live(&queue);

    let tagged = |key: &str, table: &str| {
        EventRecord::upsert(key, "P")
            .unwrap()
            .with_source(table)
            .unwrap()
    };
    queue.publish_event(tagged("u1", "users")).unwrap();
    queue.publish_event(tagged("o1", "orders")).unwrap();
    queue.publish_delete("shared").unwrap();
    queue.catch_up_timeout(3, common::WAIT_TIMEOUT).unwrap();

    assert_eq!(users.keys(), vec![b"u1".to_vec(), b"shared".to_vec()]);
    assert_eq!(orders.keys(), vec![b"o1".to_vec(), b"shared".to_vec()]);
    assert_eq!(orders.events()[1].0, EventKind::Delete);
}

#[test]
fn concurrent_publishers_get_distinct_generations() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(dir.path());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                (0..20)
                    .map(|i| queue.publish(format!("row-{t}-{i}"), "P").unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut all: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (1..=80).collect::<Vec<u64>>());
    assert_eq!(queue.write_generation(), 80);
}

#[test]
fn rejoin_racing_a_second_death_leaves_the_consumer_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(dir.path());
    let index = GatedIndex::new("gated", "slow");
    queue.register(index.clone());
    go_live(&queue);

    queue.publish("slow", "P1").unwrap();
    assert!(index.wait_entered());
    queue.on_membership_event(&MembershipEvent::Dead(LOCAL_NODE));
    assert_eq!(queue.consumer_state(), ConsumerState::Draining);

    // The rejoin blocks until the draining worker finishes its apply.
    let rejoin = {
        let queue = queue.clone();
        thread::spawn(move || queue.on_membership_event(&MembershipEvent::Joined(LOCAL_NODE)))
    };
    thread::sleep(Duration::from_millis(30));
    let second_death = {
        let queue = queue.clone();
        thread::spawn(move || queue.on_membership_event(&MembershipEvent::Dead(LOCAL_NODE)))
    };
    thread::sleep(Duration::from_millis(30));
    index.release();
    rejoin.join().unwrap();
    second_death.join().unwrap();

    assert!(!queue.lifecycle().is_live());
    assert!(wait_until(|| queue.consumer_state() == ConsumerState::Stopped));

    queue.publish("after", "P2").unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(queue.consumer_state(), ConsumerState::Stopped);
    assert_eq!(index.keys(), vec![b"slow".to_vec()]);
    assert_eq!(queue.read_generation(), 1);
}
