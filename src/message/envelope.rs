//! Envelope and metadata stamps.

use serde::{Deserialize, Serialize};

/// A metadata item attached to a message on its way through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stamp {
    /// Delay the delivery by the given number of milliseconds
    Delay { delay_ms: u64 },
    /// The message has been handed to a sender
    Sent { sender: String },
    /// Identifier assigned by the transport when the message was stored
    TransportMessageId { id: String },
    /// The message was received from a transport (never persisted)
    Received { transport: String },
    /// Name of the bus the message was dispatched on
    Bus { name: String },
    /// Number of times the message has been redelivered after a failure
    Redelivery { retry_count: u32 },
    /// Details of the last handling failure
    ErrorDetails { message: String },
    /// Application defined metadata
    Custom { name: String, value: serde_json::Value },
}

impl Stamp {
    /// Stamps describing a previous trip through a transport.
    ///
    /// These are stripped before a message is stored so a re-sent envelope
    /// does not carry stale bookkeeping.
    pub fn is_transport_internal(&self) -> bool {
        matches!(
            self,
            Self::Delay { .. } | Self::Sent { .. } | Self::TransportMessageId { .. }
        )
    }

    /// Stamps that may be serialized into the stored headers.
    pub fn is_sendable(&self) -> bool {
        !matches!(self, Self::Received { .. })
    }
}

/// A message together with its metadata stamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    message: M,
    stamps: Vec<Stamp>,
}

impl<M> Envelope<M> {
    pub fn new(message: M) -> Self {
        Self {
            message,
            stamps: Vec::new(),
        }
    }

    pub fn with_stamps(message: M, stamps: Vec<Stamp>) -> Self {
        Self { message, stamps }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_message(self) -> M {
        self.message
    }

    pub fn stamps(&self) -> &[Stamp] {
        &self.stamps
    }

    /// Append a stamp.
    pub fn with(mut self, stamp: Stamp) -> Self {
        self.stamps.push(stamp);
        self
    }

    /// Drop every stamp matching the predicate.
    pub fn without(mut self, predicate: impl Fn(&Stamp) -> bool) -> Self {
        self.stamps.retain(|stamp| !predicate(stamp));
        self
    }

    /// Delay requested by the most recent delay stamp, in milliseconds.
    pub fn delay_ms(&self) -> Option<u64> {
        self.stamps.iter().rev().find_map(|stamp| match stamp {
            Stamp::Delay { delay_ms } => Some(*delay_ms),
            _ => None,
        })
    }

    /// Id assigned by the transport, from the most recent id stamp.
    pub fn transport_message_id(&self) -> Option<&str> {
        self.stamps.iter().rev().find_map(|stamp| match stamp {
            Stamp::TransportMessageId { id } => Some(id.as_str()),
            _ => None,
        })
    }
}
