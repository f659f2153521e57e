//! Consuming side of a queue.
//!
//! Every `get` runs the due maintenance sweeps, then tries to lease one
//! record. Storage failures on the claim path are classified: transient ones
//! are absorbed a few times in a row as empty polls, anything else surfaces
//! as `QueueError::Transport`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::codec::RecordCodec;
use crate::error::QueueError;
use crate::message::{Envelope, QueueMessage, Stamp};
use crate::metrics::{BackendMetrics, QueueMetrics};
use crate::store::{Lease, MessageId, MessageRecord, MessageStore};

use super::maintenance::{MaintenanceScheduler, SweepReport};
use super::QueueConfig;

/// Claims, settles and inspects queue records.
pub struct Receiver {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    codec: RecordCodec,
    maintenance: MaintenanceScheduler,
    lease_duration: chrono::Duration,
    max_retryable_failures: u32,

    /// Consecutive retryable claim failures
    retryable_failures: AtomicU32,
}

impl Receiver {
    pub fn new(store: Arc<dyn MessageStore>, clock: Arc<dyn Clock>, config: &QueueConfig) -> Self {
        Self {
            store,
            clock,
            codec: RecordCodec::new(),
            maintenance: MaintenanceScheduler::new(config.sweep_interval),
            lease_duration: chrono::Duration::from_std(config.lease_duration)
                .unwrap_or(chrono::Duration::minutes(5)),
            max_retryable_failures: config.max_retryable_failures,
            retryable_failures: AtomicU32::new(0),
        }
    }

    /// Claim at most one message.
    ///
    /// `Ok(None)` is an empty poll: nothing claimable, another consumer won
    /// the race, the claimed record had already expired, or a transient
    /// storage failure was absorbed.
    pub async fn get<M: QueueMessage>(&self) -> Result<Option<Envelope<M>>, QueueError> {
        let now = self.clock.now();
        let backend = self.store.backend();

        self.maintenance.run(self.store.as_ref(), now).await;

        let lease = Lease::new(now, self.lease_duration);
        let claimed = match self.store.claim_next(&lease).await {
            Ok(claimed) => {
                self.retryable_failures.store(0, Ordering::SeqCst);
                claimed
            }
            Err(e) if e.is_retryable() => {
                let failures = self.retryable_failures.fetch_add(1, Ordering::SeqCst) + 1;
                BackendMetrics::record_error(backend, "claim");
                if failures > self.max_retryable_failures {
                    tracing::error!(
                        backend,
                        failures,
                        error = %e,
                        "Claim keeps failing, giving up"
                    );
                    QueueMetrics::record_claim_error(backend, false);
                    return Err(QueueError::transport(e));
                }
                tracing::warn!(backend, failures, error = %e, "Transient claim failure absorbed");
                QueueMetrics::record_claim_error(backend, true);
                return Ok(None);
            }
            Err(e) => {
                tracing::error!(backend, error = %e, "Claim failed");
                BackendMetrics::record_error(backend, "claim");
                QueueMetrics::record_claim_error(backend, false);
                return Err(QueueError::transport(e));
            }
        };

        let Some(record) = claimed else {
            QueueMetrics::record_empty_poll(backend);
            return Ok(None);
        };

        if record.is_expired(now) {
            // stays leased until its lease times out, then the expire sweep removes it
            tracing::debug!(message_id = %record.id, "Claimed record already expired, skipping");
            QueueMetrics::record_empty_poll(backend);
            return Ok(None);
        }

        QueueMetrics::record_claimed(backend);
        tracing::debug!(
            message_id = %record.id,
            delivery_id = ?record.delivery_id,
            priority = record.priority,
            "Message claimed"
        );

        self.hydrate(&record).map(Some)
    }

    /// Acknowledge a claimed message: delete it.
    pub async fn ack<M>(&self, envelope: &Envelope<M>) -> Result<(), QueueError> {
        let id = Self::message_id(envelope)?;
        let removed = self.store.delete(&id).await?;
        if !removed {
            tracing::debug!(message_id = %id, "Acked message was already gone");
        }
        QueueMetrics::record_acked(self.store.backend());
        Ok(())
    }

    /// Reject a claimed message. Rejected messages are discarded.
    pub async fn reject<M>(&self, envelope: &Envelope<M>) -> Result<(), QueueError> {
        let id = Self::message_id(envelope)?;
        self.store.delete(&id).await?;
        QueueMetrics::record_rejected(self.store.backend());
        tracing::debug!(message_id = %id, "Message rejected");
        Ok(())
    }

    /// Every queued message regardless of lease or delay, in claim order.
    pub async fn all<M: QueueMessage>(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope<M>>, QueueError> {
        self.store
            .list_all(limit)
            .await?
            .iter()
            .map(|record| self.hydrate(record))
            .collect()
    }

    /// Look a message up by id (32 hex chars or a hyphenated UUID).
    pub async fn find<M: QueueMessage>(&self, id: &str) -> Result<Option<Envelope<M>>, QueueError> {
        let id = MessageId::parse(id)?;
        match self.store.find(&id).await? {
            Some(record) => self.hydrate(&record).map(Some),
            None => Ok(None),
        }
    }

    /// Number of queued messages, leased or not.
    pub async fn count(&self) -> Result<u64, QueueError> {
        Ok(self.store.count().await?)
    }

    /// Run both maintenance sweeps immediately.
    pub async fn sweep(&self) -> SweepReport {
        self.maintenance.force(self.store.as_ref(), self.clock.now()).await
    }

    /// Consecutive retryable claim failures so far.
    pub fn retryable_failures(&self) -> u32 {
        self.retryable_failures.load(Ordering::SeqCst)
    }

    fn hydrate<M: QueueMessage>(&self, record: &MessageRecord) -> Result<Envelope<M>, QueueError> {
        let envelope: Envelope<M> = self.codec.decode(&record.body, &record.headers)?;
        Ok(envelope.with(Stamp::TransportMessageId {
            id: record.id.to_hex(),
        }))
    }

    fn message_id<M>(envelope: &Envelope<M>) -> Result<MessageId, QueueError> {
        let raw = envelope
            .transport_message_id()
            .ok_or(QueueError::MissingMessageId)?;
        MessageId::parse(raw)
    }
}
