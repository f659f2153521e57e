//! Queue facade.
//!
//! A `Queue<M>` pairs a `Sender` and a `Receiver` over one store:
//!
//! ```rust,ignore
//! let settings = Settings::new()?;
//! let queue: Queue<SendInvoice> = Queue::connect(&settings, None).await?;
//! queue.setup().await?;
//!
//! queue.send(Envelope::new(SendInvoice { invoice_id: 42 })).await?;
//!
//! while let Some(envelope) = queue.get().await? {
//!     handle(envelope.message()).await;
//!     queue.ack(&envelope).await?;
//! }
//! ```
//!
//! Delivery is at-least-once: a message claimed but never acked becomes
//! claimable again once its lease runs out.

mod maintenance;
mod receiver;
mod sender;

pub use maintenance::{MaintenanceScheduler, SweepReport};
pub use receiver::Receiver;
pub use sender::Sender;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::{QueueSettings, Settings};
use crate::dsn::Dsn;
use crate::error::QueueError;
use crate::message::{Envelope, QueueMessage};
use crate::store::{connect_store, ConnectionRegistry, MessageStore};

/// Runtime queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a claimed message stays invisible to other consumers
    pub lease_duration: Duration,
    /// Minimum time between two runs of each maintenance sweep
    pub sweep_interval: Duration,
    /// Consecutive retryable claim failures absorbed before escalating
    pub max_retryable_failures: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(300), // 5 minutes
            sweep_interval: Duration::from_secs(1),
            max_retryable_failures: 3,
        }
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            lease_duration: Duration::from_secs(settings.lease_duration_seconds),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
            max_retryable_failures: settings.max_retryable_failures,
        }
    }
}

/// A typed queue over one store.
pub struct Queue<M> {
    store: Arc<dyn MessageStore>,
    sender: Sender,
    receiver: Receiver,
    _message: PhantomData<fn() -> M>,
}

impl<M: QueueMessage> Queue<M> {
    /// Build a queue over an existing store.
    pub fn new(store: Arc<dyn MessageStore>, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            sender: Sender::new(store.clone(), clock.clone()),
            receiver: Receiver::new(store.clone(), clock, &config),
            store,
            _message: PhantomData,
        }
    }

    /// Build a queue over an existing store using the system clock.
    pub fn with_store(store: Arc<dyn MessageStore>, config: QueueConfig) -> Self {
        Self::new(store, config, Arc::new(SystemClock))
    }

    /// Connect to the store named by `settings.queue.dsn`.
    pub async fn connect(
        settings: &Settings,
        registry: Option<&ConnectionRegistry>,
    ) -> Result<Self, QueueError> {
        let dsn = Dsn::parse(&settings.queue.dsn)?;
        let store = connect_store(&dsn, settings, registry).await?;
        Ok(Self::with_store(store, QueueConfig::from(&settings.queue)))
    }

    /// Create the table or collection. Safe to call repeatedly.
    pub async fn setup(&self) -> Result<(), QueueError> {
        self.store.setup().await?;
        Ok(())
    }

    pub async fn send(&self, envelope: Envelope<M>) -> Result<Envelope<M>, QueueError> {
        self.sender.send(envelope).await
    }

    pub async fn get(&self) -> Result<Option<Envelope<M>>, QueueError> {
        self.receiver.get().await
    }

    pub async fn ack(&self, envelope: &Envelope<M>) -> Result<(), QueueError> {
        self.receiver.ack(envelope).await
    }

    pub async fn reject(&self, envelope: &Envelope<M>) -> Result<(), QueueError> {
        self.receiver.reject(envelope).await
    }

    pub async fn all(&self, limit: Option<usize>) -> Result<Vec<Envelope<M>>, QueueError> {
        self.receiver.all(limit).await
    }

    pub async fn find(&self, id: &str) -> Result<Option<Envelope<M>>, QueueError> {
        self.receiver.find(id).await
    }

    pub async fn count(&self) -> Result<u64, QueueError> {
        self.receiver.count().await
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }
}
