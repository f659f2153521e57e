//! The persisted queue record and its identifiers.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::codec::{EncodedMessage, Headers};
use crate::error::QueueError;

/// Keys this long (in characters) or longer are stored hashed.
const UNIQ_KEY_HASH_THRESHOLD: usize = 60;
/// Upper bound for the stored key, in bytes.
const UNIQ_KEY_MAX_BYTES: usize = 64;

/// Primary key of a record.
///
/// UUIDv7, so the byte order (and the hex form) follows insertion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, uuid::Error> {
        Uuid::from_slice(bytes).map(Self)
    }

    /// Parse either the 32-char hex form or a hyphenated UUID.
    pub fn parse(raw: &str) -> Result<Self, QueueError> {
        let raw = raw.trim();
        if raw.len() == 32 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            let bytes = hex::decode(raw).map_err(|e| QueueError::InvalidMessageId(e.to_string()))?;
            return Self::from_slice(&bytes).map_err(|e| QueueError::InvalidMessageId(e.to_string()));
        }

        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| QueueError::InvalidMessageId(raw.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Lowercase hex form used in transport message id stamps.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Lease token written into a record when it is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryId(Uuid);

impl DeliveryId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, uuid::Error> {
        Uuid::from_slice(bytes).map(Self)
    }

    pub fn parse_hex(raw: &str) -> Option<Self> {
        let bytes = hex::decode(raw).ok()?;
        Self::from_slice(&bytes).ok()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Parameters of one claim attempt.
#[derive(Debug, Clone, Copy)]
pub struct Lease {
    pub delivery_id: DeliveryId,
    pub now: DateTime<Utc>,
    pub redeliver_after: DateTime<Utc>,
}

impl Lease {
    pub fn new(now: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            delivery_id: DeliveryId::generate(),
            now,
            redeliver_after: now + duration,
        }
    }
}

/// One message as stored by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub published_at: DateTime<Utc>,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub priority: i32,
    pub time_to_live: Option<DateTime<Utc>>,
    pub delayed_until: Option<DateTime<Utc>>,
    pub uniq_key: Option<String>,
    pub delivery_id: Option<DeliveryId>,
    pub redeliver_after: Option<DateTime<Utc>>,
}

impl MessageRecord {
    /// Fresh, unleased record with default policy.
    pub fn new(encoded: EncodedMessage, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::generate(),
            published_at: now,
            body: encoded.body,
            headers: encoded.headers,
            properties: BTreeMap::new(),
            priority: 0,
            time_to_live: None,
            delayed_until: None,
            uniq_key: None,
            delivery_id: None,
            redeliver_after: None,
        }
    }

    pub fn is_leased(&self) -> bool {
        self.delivery_id.is_some()
    }

    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.delayed_until.is_some_and(|until| until > now)
    }

    /// Unleased and not delayed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_leased() && !self.is_delayed(now)
    }

    /// TTL set and passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.time_to_live.is_some_and(|ttl| ttl <= now)
    }

    /// Leased, with the lease timed out.
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_leased() && self.redeliver_after.is_some_and(|after| after < now)
    }

    pub fn lease(&mut self, lease: &Lease) {
        self.delivery_id = Some(lease.delivery_id);
        self.redeliver_after = Some(lease.redeliver_after);
    }

    pub fn release(&mut self) {
        self.delivery_id = None;
        self.redeliver_after = None;
    }

    /// Claim order: priority desc, published_at asc, id asc.
    pub fn claim_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.published_at.cmp(&other.published_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Normalize a uniqueness key to fit the storage column.
///
/// Keys of 60 characters or more (or longer than 64 bytes) are replaced by
/// their SHA-256 hex digest.
pub fn normalize_uniq_key(key: &str) -> String {
    if key.chars().count() >= UNIQ_KEY_HASH_THRESHOLD || key.len() > UNIQ_KEY_MAX_BYTES {
        hex::encode(Sha256::digest(key.as_bytes()))
    } else {
        key.to_string()
    }
}
