//! Messages carried by the queue.
//!
//! A queue is typed by its message. Payloads are serialized with `serde`;
//! the `MESSAGE_TYPE` name is stored alongside the body so a record written
//! for one message type is never decoded as another. Queues carrying several
//! kinds of messages use an enum as their message type.

mod envelope;
mod policy;

pub use envelope::{Envelope, Stamp};
pub use policy::MessagePolicy;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A message that can be sent through a queue.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendInvoice { invoice_id: u64 }
///
/// impl QueueMessage for SendInvoice {
///     const MESSAGE_TYPE: &'static str = "billing.send_invoice";
///
///     fn policy(&self) -> MessagePolicy {
///         MessagePolicy::new()
///             .priority(10)
///             .unique(format!("invoice-{}", self.invoice_id))
///     }
/// }
/// ```
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type name written to the `type` header.
    const MESSAGE_TYPE: &'static str;

    /// Delivery capabilities of this message instance.
    fn policy(&self) -> MessagePolicy {
        MessagePolicy::default()
    }
}
