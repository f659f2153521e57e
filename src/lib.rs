// Infrastructure layer (shared components)
pub mod infrastructure;

pub mod clock;
pub mod config;
pub mod dsn;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Queue layer
pub mod codec;
pub mod message;
pub mod store;
pub mod transport;

pub use error::{QueueError, Result};
pub use message::{Envelope, MessagePolicy, QueueMessage, Stamp};
pub use transport::{Queue, QueueConfig};
