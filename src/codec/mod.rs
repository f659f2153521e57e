//! Record codec: envelope <-> `{body, headers}`.
//!
//! The body is the JSON serialization of the message. Headers carry the
//! message type and every sendable stamp, so an envelope read back from
//! storage has the same metadata it was sent with.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::message::{Envelope, QueueMessage, Stamp};

/// Header holding the message type name.
pub const TYPE_HEADER: &str = "type";
/// Header holding the serialized stamps.
pub const STAMPS_HEADER: &str = "X-Message-Envelope-Items";
/// Header holding the body content type.
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

const CONTENT_TYPE_JSON: &str = "application/json";

/// String-keyed header map stored with every record.
pub type Headers = BTreeMap<String, String>;

/// Errors raised while turning a stored record back into an envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("encoded envelope should have at least a body and some headers")]
    Incomplete,

    #[error("encoded envelope does not have a `type` header")]
    MissingType,

    #[error("unexpected message type `{found}` (queue carries `{expected}`)")]
    UnknownType { expected: &'static str, found: String },

    #[error("invalid message body: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("invalid envelope items header: {0}")]
    Stamps(#[source] serde_json::Error),
}

/// Body and headers produced by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
}

/// Stateless JSON codec for queue messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordCodec;

impl RecordCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode an envelope. Non-sendable stamps are dropped.
    pub fn encode<M: QueueMessage>(
        &self,
        envelope: &Envelope<M>,
    ) -> Result<EncodedMessage, serde_json::Error> {
        self.encode_with(envelope, |_| true)
    }

    /// Encode an envelope keeping only the sendable stamps accepted by `keep`.
    pub fn encode_with<M: QueueMessage>(
        &self,
        envelope: &Envelope<M>,
        keep: impl Fn(&Stamp) -> bool,
    ) -> Result<EncodedMessage, serde_json::Error> {
        let body = serde_json::to_vec(envelope.message())?;

        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER.to_string(), M::MESSAGE_TYPE.to_string());
        headers.insert(CONTENT_TYPE_HEADER.to_string(), CONTENT_TYPE_JSON.to_string());

        let stamps: Vec<&Stamp> = envelope
            .stamps()
            .iter()
            .filter(|stamp| stamp.is_sendable() && keep(stamp))
            .collect();
        if !stamps.is_empty() {
            headers.insert(STAMPS_HEADER.to_string(), serde_json::to_string(&stamps)?);
        }

        Ok(EncodedMessage { body, headers })
    }

    /// Decode a stored body and headers into an envelope.
    pub fn decode<M: QueueMessage>(
        &self,
        body: &[u8],
        headers: &Headers,
    ) -> Result<Envelope<M>, DecodeError> {
        if body.is_empty() || headers.is_empty() {
            return Err(DecodeError::Incomplete);
        }

        let message_type = headers
            .get(TYPE_HEADER)
            .filter(|t| !t.is_empty())
            .ok_or(DecodeError::MissingType)?;
        if message_type != M::MESSAGE_TYPE {
            return Err(DecodeError::UnknownType {
                expected: M::MESSAGE_TYPE,
                found: message_type.clone(),
            });
        }

        let stamps = match headers.get(STAMPS_HEADER) {
            Some(raw) => serde_json::from_str::<Vec<Stamp>>(raw).map_err(DecodeError::Stamps)?,
            None => Vec::new(),
        };

        let message: M = serde_json::from_slice(body).map_err(DecodeError::Payload)?;

        Ok(Envelope::with_stamps(message, stamps))
    }
}
