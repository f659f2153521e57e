//! Publishing side of a queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::codec::RecordCodec;
use crate::error::QueueError;
use crate::message::{Envelope, MessagePolicy, QueueMessage, Stamp};
use crate::metrics::{BackendMetrics, QueueMetrics};
use crate::store::{normalize_uniq_key, MessageRecord, MessageStore};

/// Encodes envelopes and inserts them as queue records.
pub struct Sender {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    codec: RecordCodec,
}

impl Sender {
    pub fn new(store: Arc<dyn MessageStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            codec: RecordCodec::new(),
        }
    }

    /// Send an envelope.
    ///
    /// Returns the envelope with a `TransportMessageId` stamp holding the new
    /// record id. When the message carries a uniqueness key and an unleased
    /// message with the same key is already queued, nothing is inserted and
    /// the envelope comes back unchanged.
    pub async fn send<M: QueueMessage>(
        &self,
        envelope: Envelope<M>,
    ) -> Result<Envelope<M>, QueueError> {
        let now = self.clock.now();
        let policy = envelope.message().policy();
        let directive = envelope.delay_ms().map(Duration::from_millis);

        let encoded = self
            .codec
            .encode_with(&envelope, |stamp| !stamp.is_transport_internal())?;
        let mut record = MessageRecord::new(encoded, now);
        apply_policy(&mut record, &policy, directive, now);

        if let Some(uniq_key) = &record.uniq_key {
            if let Some(existing) = self.store.find_unleased_by_uniq_key(uniq_key).await? {
                tracing::debug!(
                    message_type = M::MESSAGE_TYPE,
                    uniq_key = %uniq_key,
                    existing = %existing,
                    "Duplicate message suppressed"
                );
                QueueMetrics::record_duplicate(self.store.backend());
                return Ok(envelope);
            }
        }

        let started = Instant::now();
        if let Err(e) = self.store.insert(&record).await {
            BackendMetrics::record_error(self.store.backend(), "insert");
            return Err(e.into());
        }
        BackendMetrics::record_latency(self.store.backend(), "send", started.elapsed().as_secs_f64());
        QueueMetrics::record_sent(self.store.backend());

        tracing::debug!(
            message_id = %record.id,
            message_type = M::MESSAGE_TYPE,
            priority = record.priority,
            delayed_until = ?record.delayed_until,
            "Message sent"
        );

        Ok(envelope.with(Stamp::TransportMessageId {
            id: record.id.to_hex(),
        }))
    }
}

/// Fill the policy columns of a fresh record.
///
/// A delay declared by the message wins over a delay stamp on the envelope.
fn apply_policy(
    record: &mut MessageRecord,
    policy: &MessagePolicy,
    directive: Option<Duration>,
    now: DateTime<Utc>,
) {
    if let Some(delay) = policy.delay.or(directive) {
        record.delayed_until = Some(after(now, delay));
    }
    if let Some(ttl) = policy.ttl {
        record.time_to_live = Some(after(now, ttl));
    }
    if let Some(priority) = policy.priority {
        record.priority = priority;
    }
    if let Some(key) = &policy.uniqueness_key {
        record.uniq_key = Some(normalize_uniq_key(key));
    }
}

/// `now + duration`, saturating at the largest representable instant.
fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::{EncodedMessage, Headers};
    use crate::store::{MemoryStore, MessageId};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        key: String,
        delay_ms: Option<u64>,
    }

    impl QueueMessage for Job {
        const MESSAGE_TYPE: &'static str = "test.job";

        fn policy(&self) -> MessagePolicy {
            let mut policy = MessagePolicy::new().priority(7).ttl_secs(60).unique(&self.key);
            if let Some(ms) = self.delay_ms {
                policy = policy.delay_ms(ms);
            }
            policy
        }
    }

    fn job(key: &str, delay_ms: Option<u64>) -> Job {
        Job {
            key: key.to_string(),
            delay_ms,
        }
    }

    fn sender() -> (Sender, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::default());
        let clock = Arc::new(ManualClock::default());
        (Sender::new(store.clone(), clock.clone()), store, clock)
    }

    #[test]
    fn test_policy_delay_beats_directive() {
        let now = Utc::now();
        let mut record = MessageRecord::new(
            EncodedMessage {
                body: b"{}".to_vec(),
                headers: Headers::new(),
            },
            now,
        );
        let policy = MessagePolicy::new().delay_ms(100);

        apply_policy(&mut record, &policy, Some(Duration::from_secs(60)), now);
        assert_eq!(record.delayed_until, Some(now + chrono::Duration::milliseconds(100)));
    }

    #[tokio::test]
    async fn test_send_applies_policy_and_stamps_id() {
        let (sender, store, clock) = sender();
        let now = clock.now();

        let sent = sender.send(Envelope::new(job("a", None))).await.unwrap();
        let id = MessageId::parse(sent.transport_message_id().unwrap()).unwrap();

        let record = store.find(&id).await.unwrap().unwrap();
        assert_eq!(record.priority, 7);
        assert_eq!(record.time_to_live, Some(now + chrono::Duration::seconds(60)));
        assert_eq!(record.uniq_key.as_deref(), Some("a"));
        assert_eq!(record.published_at, now);
        assert!(!record.is_leased());
    }

    #[tokio::test]
    async fn test_delay_stamp_used_without_policy_delay() {
        let (sender, store, clock) = sender();
        let now = clock.now();

        let sent = sender
            .send(Envelope::new(job("b", None)).with(Stamp::Delay { delay_ms: 2500 }))
            .await
            .unwrap();
        let id = MessageId::parse(sent.transport_message_id().unwrap()).unwrap();

        let record = store.find(&id).await.unwrap().unwrap();
        assert_eq!(record.delayed_until, Some(now + chrono::Duration::milliseconds(2500)));
    }

    #[tokio::test]
    async fn test_transport_internal_stamps_not_stored() {
        let (sender, store, _) = sender();

        let sent = sender
            .send(
                Envelope::new(job("c", None))
                    .with(Stamp::Delay { delay_ms: 10 })
                    .with(Stamp::Sent { sender: "db".to_string() })
                    .with(Stamp::TransportMessageId { id: "stale".to_string() })
                    .with(Stamp::Bus { name: "default".to_string() }),
            )
            .await
            .unwrap();
        let id = MessageId::parse(sent.transport_message_id().unwrap()).unwrap();

        let record = store.find(&id).await.unwrap().unwrap();
        let decoded: Envelope<Job> = RecordCodec::new().decode(&record.body, &record.headers).unwrap();
        assert_eq!(decoded.stamps(), &[Stamp::Bus { name: "default".to_string() }]);
    }

    #[tokio::test]
    async fn test_duplicate_suppressed() {
        let (sender, store, _) = sender();

        sender.send(Envelope::new(job("same", None))).await.unwrap();
        let second = sender.send(Envelope::new(job("same", None))).await.unwrap();

        assert!(second.transport_message_id().is_none());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_long_uniq_key_hashed() {
        let (sender, store, _) = sender();
        let long_key = "x".repeat(80);

        let sent = sender.send(Envelope::new(job(&long_key, None))).await.unwrap();
        let id = MessageId::parse(sent.transport_message_id().unwrap()).unwrap();

        let record = store.find(&id).await.unwrap().unwrap();
        assert_eq!(record.uniq_key, Some(normalize_uniq_key(&long_key)));
        assert_eq!(record.uniq_key.unwrap().len(), 64);
    }
}
