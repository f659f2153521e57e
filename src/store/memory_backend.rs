//! In-memory queue store.
//!
//! Records live in a map guarded by a single async mutex, which makes every
//! operation atomic. Messages are lost when the process exits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StorageError;

use super::{Lease, MessageId, MessageRecord, MessageStore};

/// In-memory queue store.
pub struct MemoryStore {
    name: String,
    records: Mutex<BTreeMap<MessageId, MessageRecord>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("messenger")
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn collection(&self) -> &str {
        &self.name
    }

    async fn setup(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn insert(&self, record: &MessageRecord) -> Result<(), StorageError> {
        let mut records = self.records.lock().await;
        records.insert(record.id, record.clone());

        tracing::trace!(
            message_id = %record.id,
            queue = %self.name,
            queue_size = records.len(),
            "Record stored in memory"
        );

        Ok(())
    }

    async fn find_unleased_by_uniq_key(
        &self,
        uniq_key: &str,
    ) -> Result<Option<MessageId>, StorageError> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .find(|r| !r.is_leased() && r.uniq_key.as_deref() == Some(uniq_key))
            .map(|r| r.id))
    }

    async fn claim_next(&self, lease: &Lease) -> Result<Option<MessageRecord>, StorageError> {
        let mut records = self.records.lock().await;

        let candidate = records
            .values()
            .filter(|r| r.is_claimable(lease.now))
            .min_by(|a, b| a.claim_order(b))
            .map(|r| r.id);

        Ok(candidate.and_then(|id| {
            records.get_mut(&id).map(|record| {
                record.lease(lease);
                record.clone()
            })
        }))
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.is_leased() || !r.is_expired(now));
        Ok((before - records.len()) as u64)
    }

    async fn sweep_orphan_leases(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut records = self.records.lock().await;
        let mut released = 0;
        for record in records.values_mut() {
            if record.is_lease_expired(now) {
                record.release();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn delete(&self, id: &MessageId) -> Result<bool, StorageError> {
        Ok(self.records.lock().await.remove(id).is_some())
    }

    async fn list_all(&self, limit: Option<usize>) -> Result<Vec<MessageRecord>, StorageError> {
        let records = self.records.lock().await;
        let mut all: Vec<MessageRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.claim_order(b));
        if let Some(limit) = limit {
            all.truncate(limit);
        }
        Ok(all)
    }

    async fn find(&self, id: &MessageId) -> Result<Option<MessageRecord>, StorageError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.records.lock().await.len() as u64)
    }
}
