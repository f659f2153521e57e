//! Storage backends for the leased queue.
//!
//! Every backend implements `MessageStore`, one atomic primitive per method:
//!
//! - `PostgresStore`: two-step claim (select candidate, guarded UPDATE)
//! - `RedisStore`: one-step claim through a server-side script that also
//!   reclaims timed-out leases
//! - `MemoryStore`: in-process map behind one mutex
//!
//! Use `connect_store()` to build the backend named by a DSN.

mod factory;
pub mod memory_backend;
pub mod postgres_backend;
mod record;
pub mod redis_backend;

pub use factory::{connect_store, ConnectionRegistry, RegisteredConnection};
pub use memory_backend::MemoryStore;
pub use postgres_backend::PostgresStore;
pub use record::{normalize_uniq_key, DeliveryId, Lease, MessageId, MessageRecord};
pub use redis_backend::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;

/// Storage contract of the leased queue.
///
/// # Concurrency
///
/// `claim_next` must never hand the same record to two callers. Every other
/// mutating method is a single atomic store operation; callers may observe
/// the state before or after it, never in between.
///
/// # Time
///
/// Implementations never read the clock. Every time-dependent method
/// receives `now` (directly or through the `Lease`).
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Backend name used in logs and metrics.
    fn backend(&self) -> &'static str;

    /// Table, collection or namespace holding the records.
    fn collection(&self) -> &str;

    /// Create the backing table/collection and its indexes. Idempotent.
    async fn setup(&self) -> Result<(), StorageError>;

    /// Store a new record.
    async fn insert(&self, record: &MessageRecord) -> Result<(), StorageError>;

    /// Id of a record carrying `uniq_key` with no lease, if any.
    async fn find_unleased_by_uniq_key(
        &self,
        uniq_key: &str,
    ) -> Result<Option<MessageId>, StorageError>;

    /// Lease the first claimable record in claim order.
    ///
    /// Returns the leased record, or `None` when nothing was claimed this
    /// round (empty queue, or another consumer won the race).
    async fn claim_next(&self, lease: &Lease) -> Result<Option<MessageRecord>, StorageError>;

    /// Delete unleased records whose TTL has passed. Returns the number removed.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Release leases that timed out. Returns the number released.
    ///
    /// Backends that reclaim timed-out leases inside `claim_next` return 0.
    async fn sweep_orphan_leases(&self, now: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Delete a record by id. Returns whether a record was removed.
    async fn delete(&self, id: &MessageId) -> Result<bool, StorageError>;

    /// Every record regardless of state, in claim order.
    async fn list_all(&self, limit: Option<usize>) -> Result<Vec<MessageRecord>, StorageError>;

    /// Point lookup by id.
    async fn find(&self, id: &MessageId) -> Result<Option<MessageRecord>, StorageError>;

    /// Total number of records, leased or not.
    async fn count(&self) -> Result<u64, StorageError>;
}
