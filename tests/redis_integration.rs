//! Redis backend integration tests.
//!
//! Require a running server:
//!
//! ```bash
//! LEASEQ_TEST_REDIS_URL=redis://localhost:6379 \
//!     cargo test --test redis_integration -- --ignored
//! ```
//!
//! Every test works in its own collection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use leaseq::clock::{Clock, ManualClock};
use leaseq::codec::{EncodedMessage, Headers, TYPE_HEADER};
use leaseq::infrastructure::redis::RedisPool;
use leaseq::store::{Lease, MessageId, MessageRecord, MessageStore, RedisStore};
use leaseq::{Envelope, MessagePolicy, Queue, QueueConfig, QueueMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Task {
    name: String,
    priority: i32,
    delay_ms: Option<u64>,
    ttl_secs: Option<u64>,
    key: Option<String>,
}

impl QueueMessage for Task {
    const MESSAGE_TYPE: &'static str = "test.task";

    fn policy(&self) -> MessagePolicy {
        let mut policy = MessagePolicy::new().priority(self.priority);
        if let Some(ms) = self.delay_ms {
            policy = policy.delay_ms(ms);
        }
        if let Some(secs) = self.ttl_secs {
            policy = policy.ttl_secs(secs);
        }
        if let Some(key) = &self.key {
            policy = policy.unique(key.clone());
        }
        policy
    }
}

fn task(name: &str, priority: i32) -> Task {
    Task {
        name: name.to_string(),
        priority,
        delay_ms: None,
        ttl_secs: None,
        key: None,
    }
}

fn redis_url() -> String {
    std::env::var("LEASEQ_TEST_REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Helper to create a store in a fresh collection
async fn create_store() -> Arc<RedisStore> {
    let pool = Arc::new(RedisPool::new(&redis_url()).unwrap());

    let collection = format!("test_{}", uuid::Uuid::new_v4().simple());
    let store = RedisStore::new(pool, "leaseq-test", collection).unwrap();
    store.setup().await.expect("Redis not reachable");
    Arc::new(store)
}

fn create_queue(store: Arc<RedisStore>, clock: Arc<ManualClock>) -> Queue<Task> {
    let config = QueueConfig {
        lease_duration: Duration::from_secs(5),
        ..QueueConfig::default()
    };
    Queue::new(store, config, clock)
}

/// Whole-microsecond instant, the precision the store keeps
fn now_micros() -> DateTime<Utc> {
    DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap()
}

fn raw_record(published_at: DateTime<Utc>) -> MessageRecord {
    MessageRecord::new(
        EncodedMessage {
            body: br#"{"name":"raw","priority":0,"delay_ms":null,"ttl_secs":null,"key":null}"#.to_vec(),
            headers: Headers::from([(TYPE_HEADER.to_string(), Task::MESSAGE_TYPE.to_string())]),
        },
        published_at,
    )
}

fn lease(now: DateTime<Utc>) -> Lease {
    Lease::new(now, chrono::Duration::seconds(5))
}

#[tokio::test]
#[ignore]
async fn test_send_get_ack() {
    let store = create_store().await;
    let queue = create_queue(store, Arc::new(ManualClock::default()));

    queue.send(Envelope::new(task("low", 1))).await.unwrap();
    queue.send(Envelope::new(task("high", 5))).await.unwrap();
    queue.send(Envelope::new(task("mid", 3))).await.unwrap();

    let mut order = Vec::new();
    while let Some(envelope) = queue.get().await.unwrap() {
        order.push(envelope.message().name.clone());
        queue.ack(&envelope).await.unwrap();
    }

    assert_eq!(order, vec!["high", "mid", "low"]);
    assert_eq!(queue.count().await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_concurrent_claims_single_winner() {
    let store = create_store().await;
    let clock = Arc::new(ManualClock::default());
    let queue = create_queue(store.clone(), clock.clone());
    queue.send(Envelope::new(task("contended", 0))).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let queue = create_queue(store.clone(), clock.clone());
            tokio::spawn(async move { queue.get().await.unwrap().is_some() })
        })
        .collect();

    let winners = join_all(handles)
        .await
        .into_iter()
        .filter(|won| *won.as_ref().unwrap())
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
#[ignore]
async fn test_timed_out_lease_reclaimed_by_claim() {
    let store = create_store().await;
    let clock = Arc::new(ManualClock::new(now_micros()));
    let queue = create_queue(store.clone(), clock.clone());
    queue.send(Envelope::new(task("abandoned", 0))).await.unwrap();

    let first = queue.get().await.unwrap().unwrap();
    assert!(queue.get().await.unwrap().is_none());

    // exactly at redeliver_after the lease still holds
    clock.advance(chrono::Duration::seconds(5));
    assert!(queue.get().await.unwrap().is_none());

    clock.advance(chrono::Duration::seconds(1));
    assert_eq!(store.sweep_orphan_leases(clock.now()).await.unwrap(), 0);

    let second = queue.get().await.unwrap().unwrap();
    assert_eq!(first.transport_message_id(), second.transport_message_id());
}

#[tokio::test]
#[ignore]
async fn test_delayed_record_not_claimed_early() {
    let store = create_store().await;
    let clock = Arc::new(ManualClock::new(now_micros()));
    let queue = create_queue(store, clock.clone());

    let mut later = task("later", 0);
    later.delay_ms = Some(10_000);
    queue.send(Envelope::new(later)).await.unwrap();
    queue.send(Envelope::new(task("now", -1))).await.unwrap();

    assert_eq!(queue.get().await.unwrap().unwrap().message().name, "now");
    assert!(queue.get().await.unwrap().is_none());

    clock.advance(chrono::Duration::milliseconds(9_999));
    assert!(queue.get().await.unwrap().is_none());

    clock.advance(chrono::Duration::milliseconds(1));
    assert_eq!(queue.get().await.unwrap().unwrap().message().name, "later");
}

#[tokio::test]
#[ignore]
async fn test_sweep_expired_keeps_leased_records() {
    let store = create_store().await;
    let now = now_micros();

    let mut leased = raw_record(now);
    leased.priority = 10;
    leased.time_to_live = Some(now - chrono::Duration::seconds(1));
    store.insert(&leased).await.unwrap();
    let claimed = store.claim_next(&lease(now)).await.unwrap().unwrap();
    assert_eq!(claimed.id, leased.id);

    let mut idle = raw_record(now);
    idle.time_to_live = Some(now - chrono::Duration::seconds(1));
    idle.uniq_key = Some("nightly".to_string());
    store.insert(&idle).await.unwrap();

    let mut at_boundary = raw_record(now);
    at_boundary.time_to_live = Some(now);
    store.insert(&at_boundary).await.unwrap();

    let mut alive = raw_record(now);
    alive.time_to_live = Some(now + chrono::Duration::seconds(60));
    store.insert(&alive).await.unwrap();

    assert_eq!(store.sweep_expired(now).await.unwrap(), 2);
    assert!(store.find(&leased.id).await.unwrap().is_some());
    assert!(store.find(&idle.id).await.unwrap().is_none());
    assert!(store.find(&at_boundary.id).await.unwrap().is_none());
    assert!(store.find(&alive.id).await.unwrap().is_some());
    assert!(store.find_unleased_by_uniq_key("nightly").await.unwrap().is_none());
    assert_eq!(store.count().await.unwrap(), 2);

    // swept records are gone from the claim index too
    let next = store.claim_next(&lease(now)).await.unwrap().unwrap();
    assert_eq!(next.id, alive.id);
    assert!(store.claim_next(&lease(now)).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_equal_priority_claims_oldest_publish_first() {
    let store = create_store().await;
    let now = now_micros();

    let mut newer = raw_record(now);
    newer.id = MessageId::from_uuid(uuid::Uuid::from_u128(1));
    let mut older = raw_record(now - chrono::Duration::seconds(5));
    older.id = MessageId::from_uuid(uuid::Uuid::from_u128(2));
    store.insert(&newer).await.unwrap();
    store.insert(&older).await.unwrap();

    let listed: Vec<MessageId> = store.list_all(None).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(listed, vec![older.id, newer.id]);

    let first = store.claim_next(&lease(now)).await.unwrap().unwrap();
    let second = store.claim_next(&lease(now)).await.unwrap().unwrap();
    assert_eq!(first.id, older.id);
    assert_eq!(second.id, newer.id);
}

#[tokio::test]
#[ignore]
async fn test_equal_priority_and_time_claims_ascending_id() {
    let store = create_store().await;
    let now = now_micros();

    let mut ids = Vec::new();
    for n in [3u128, 1, 2] {
        let mut record = raw_record(now);
        record.id = MessageId::from_uuid(uuid::Uuid::from_u128(n));
        store.insert(&record).await.unwrap();
        ids.push(record.id);
    }
    ids.sort();

    let mut claimed = Vec::new();
    while let Some(record) = store.claim_next(&lease(now)).await.unwrap() {
        claimed.push(record.id);
    }
    assert_eq!(claimed, ids);

    let listed: Vec<MessageId> = store.list_all(Some(2)).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(listed, ids[..2].to_vec());
    assert_eq!(store.list_all(Some(usize::MAX)).await.unwrap().len(), 3);
    assert!(store.list_all(Some(0)).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_scenario_priority_delay_and_ttl() {
    let store = create_store().await;
    let clock = Arc::new(ManualClock::new(now_micros()));
    let queue = create_queue(store, clock.clone());

    queue.send(Envelope::new(task("A", 0))).await.unwrap();

    let mut b = task("B", 10);
    b.delay_ms = Some(0);
    queue.send(Envelope::new(b)).await.unwrap();

    let mut c = task("C", 0);
    c.ttl_secs = Some(1);
    queue.send(Envelope::new(c)).await.unwrap();

    clock.advance(chrono::Duration::seconds(2));

    let mut order = Vec::new();
    while let Some(envelope) = queue.get().await.unwrap() {
        order.push(envelope.message().name.clone());
        queue.ack(&envelope).await.unwrap();
    }
    assert_eq!(order, vec!["B", "A"]);
    assert_eq!(queue.count().await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_uniqueness_and_delete() {
    let store = create_store().await;
    let queue = create_queue(store, Arc::new(ManualClock::default()));

    let mut unique = task("once", 0);
    unique.key = Some("report-7".to_string());
    queue.send(Envelope::new(unique.clone())).await.unwrap();
    queue.send(Envelope::new(unique)).await.unwrap();
    assert_eq!(queue.count().await.unwrap(), 1);

    let envelope = queue.get().await.unwrap().unwrap();
    queue.reject(&envelope).await.unwrap();
    assert_eq!(queue.count().await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_vanished_hash_cleaned_from_indexes() {
    let store = create_store().await;
    let now = now_micros();

    let mut gone = raw_record(now);
    gone.priority = 5;
    gone.uniq_key = Some("dangling".to_string());
    store.insert(&gone).await.unwrap();
    let kept = raw_record(now);
    store.insert(&kept).await.unwrap();

    // hash removed behind the store's back
    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let pattern = format!("leaseq-test:{}:msg:{}", store.collection(), gone.id.to_hex());
    let _: () = conn.del(pattern).await.unwrap();

    assert!(store.find_unleased_by_uniq_key("dangling").await.unwrap().is_none());
    let claimed = store.claim_next(&lease(now)).await.unwrap().unwrap();
    assert_eq!(claimed.id, kept.id);
    assert_eq!(store.count().await.unwrap(), 1);
}
