//! Redis-based queue store.
//!
//! Every record is a hash. Sorted sets index the records by state, so each
//! script only touches the entries it acts on:
//!
//! - `...:queue` every record, score `-priority` (listing and count)
//! - `...:ready` claimable records, score `-priority`
//! - `...:delayed` delayed records, score `delayed_until`
//! - `...:leased` leased records, score `redeliver_after`
//! - `...:ttl` records with a TTL, score `time_to_live`
//! - `...:uniq:{uniq_key}` set of members carrying that key
//! - `...:msg:{hex id}` record hash
//!
//! Set members are the record's index member: the publish time as a
//! fixed-width sortable number followed by the hex id. Equal scores order
//! lexicographically by member, which gives `published_at asc, id asc`.
//!
//! Claiming is one script: it moves due delayed records and timed-out leases
//! into `ready`, then leases the head of `ready`. Lease reclamation is
//! therefore part of the claim and `sweep_orphan_leases` is a no-op for this
//! backend.
//!
//! The index keys are passed to the scripts as `KEYS`; record hashes are
//! addressed from index members inside the scripts, so the store targets a
//! standalone Redis, not a cluster.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script, ScriptInvocation};

use crate::codec::Headers;
use crate::dsn::mask_password;
use crate::error::{QueueError, StorageError};
use crate::infrastructure::redis::RedisPool;
use crate::metrics::BackendMetrics;

use super::postgres_backend::is_valid_table_name;
use super::{DeliveryId, Lease, MessageId, MessageRecord, MessageStore};

const BACKEND: &str = "redis";

/// Width of the publish-time prefix of an index member.
const MEMBER_TIME_WIDTH: usize = 20;

// KEYS: queue, ready, delayed, leased, ttl
// ARGV: record prefix, now, delivery id, redeliver_after
// Timestamps stay strings: Lua numbers lose precision when handed back to Redis.
const CLAIM_SCRIPT: &str = r#"
local function promote(source, max)
    local due = redis.call('ZRANGEBYSCORE', source, '-inf', max)
    for _, member in ipairs(due) do
        redis.call('ZREM', source, member)
        local key = ARGV[1] .. string.sub(member, 21)
        local priority = redis.call('HGET', key, 'priority')
        if priority then
            redis.call('HDEL', key, 'delivery_id', 'redeliver_after')
            redis.call('ZADD', KEYS[2], -tonumber(priority), member)
        end
    end
end

promote(KEYS[3], ARGV[2])
promote(KEYS[4], '(' .. ARGV[2])

while true do
    local head = redis.call('ZRANGE', KEYS[2], 0, 0)
    if #head == 0 then
        return false
    end
    local member = head[1]
    redis.call('ZREM', KEYS[2], member)
    local key = ARGV[1] .. string.sub(member, 21)
    if redis.call('EXISTS', key) == 1 then
        redis.call('HSET', key, 'delivery_id', ARGV[3], 'redeliver_after', ARGV[4])
        redis.call('ZADD', KEYS[4], ARGV[4], member)
        return redis.call('HGETALL', key)
    end
    redis.call('ZREM', KEYS[1], member)
    redis.call('ZREM', KEYS[5], member)
end
"#;

// KEYS: queue, ready, delayed, leased, ttl
// ARGV: record prefix, uniq prefix, now
const SWEEP_EXPIRED_SCRIPT: &str = r#"
local now = tonumber(ARGV[3])
local removed = 0
local due = redis.call('ZRANGEBYSCORE', KEYS[5], '-inf', ARGV[3])
for _, member in ipairs(due) do
    local key = ARGV[1] .. string.sub(member, 21)
    local state = redis.call('HMGET', key, 'id', 'delivery_id', 'redeliver_after', 'uniq_key')
    local unleased = (not state[2]) or (state[3] and tonumber(state[3]) < now)
    if unleased then
        for i = 1, 5 do
            redis.call('ZREM', KEYS[i], member)
        end
        if state[4] then
            redis.call('SREM', ARGV[2] .. state[4], member)
        end
        if state[1] then
            redis.call('DEL', key)
            removed = removed + 1
        end
    end
end
return removed
"#;

// KEYS: queue, ready, delayed, leased, ttl
// ARGV: record key, uniq prefix
const DELETE_SCRIPT: &str = r#"
local state = redis.call('HMGET', ARGV[1], 'member', 'uniq_key')
if not state[1] then
    return 0
end
redis.call('DEL', ARGV[1])
for i = 1, 5 do
    redis.call('ZREM', KEYS[i], state[1])
end
if state[2] then
    redis.call('SREM', ARGV[2] .. state[2], state[1])
end
return 1
"#;

// KEYS: uniq set
// ARGV: record prefix
const FIND_UNLEASED_SCRIPT: &str = r#"
local members = redis.call('SMEMBERS', KEYS[1])
for _, member in ipairs(members) do
    local state = redis.call('HMGET', ARGV[1] .. string.sub(member, 21), 'id', 'delivery_id')
    if not state[1] then
        redis.call('SREM', KEYS[1], member)
    elseif not state[2] then
        return state[1]
    end
end
return false
"#;

struct Scripts {
    claim: Script,
    sweep_expired: Script,
    delete: Script,
    find_unleased: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            claim: Script::new(CLAIM_SCRIPT),
            sweep_expired: Script::new(SWEEP_EXPIRED_SCRIPT),
            delete: Script::new(DELETE_SCRIPT),
            find_unleased: Script::new(FIND_UNLEASED_SCRIPT),
        }
    }

    fn all(&self) -> [&Script; 4] {
        [&self.claim, &self.sweep_expired, &self.delete, &self.find_unleased]
    }
}

/// Redis-based queue store.
pub struct RedisStore {
    /// Redis connection pool
    pool: Arc<RedisPool>,

    /// Key prefix for Redis keys
    prefix: String,

    /// Collection name, second key segment
    collection: String,

    scripts: Arc<Scripts>,
}

impl RedisStore {
    /// Create a store over a shared pool.
    ///
    /// Fails if `collection` is not a plain identifier.
    pub fn new(
        pool: Arc<RedisPool>,
        prefix: impl Into<String>,
        collection: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let collection = collection.into();
        if !is_valid_table_name(&collection) {
            return Err(QueueError::config(format!(
                "invalid collection name `{}`",
                collection
            )));
        }

        Ok(Self {
            pool,
            prefix: prefix.into(),
            collection,
            scripts: Arc::new(Scripts::new()),
        })
    }

    fn namespace(&self) -> String {
        format!("{}:{}", self.prefix, self.collection)
    }

    fn index_key(&self, index: &str) -> String {
        format!("{}:{}", self.namespace(), index)
    }

    /// `queue`, `ready`, `delayed`, `leased` and `ttl` keys, in script order.
    fn index_keys(&self) -> [String; 5] {
        ["queue", "ready", "delayed", "leased", "ttl"].map(|index| self.index_key(index))
    }

    fn record_prefix(&self) -> String {
        format!("{}:msg:", self.namespace())
    }

    fn record_key(&self, id: &MessageId) -> String {
        format!("{}{}", self.record_prefix(), id.to_hex())
    }

    fn uniq_prefix(&self) -> String {
        format!("{}:uniq:", self.namespace())
    }

    fn observe(&self, operation: &str, started: Instant) {
        BackendMetrics::record_latency(BACKEND, operation, started.elapsed().as_secs_f64());
    }
}

fn with_index_keys<'a>(mut invocation: ScriptInvocation<'a>, keys: &[String; 5]) -> ScriptInvocation<'a> {
    for key in keys {
        invocation.key(key);
    }
    invocation
}

/// Sorted-set member of a record: publish time, then the hex id.
///
/// The signed microsecond timestamp is mapped onto `u64` with its sign bit
/// flipped so the decimal form sorts like the instant.
fn index_member(record: &MessageRecord) -> String {
    let micros = record.published_at.timestamp_micros();
    format!(
        "{:0width$}{}",
        (micros as u64) ^ (1 << 63),
        record.id.to_hex(),
        width = MEMBER_TIME_WIDTH
    )
}

fn id_from_member(member: &str) -> Result<MessageId, StorageError> {
    member
        .get(MEMBER_TIME_WIDTH..)
        .ok_or_else(|| StorageError::corrupt(member, "index member too short"))
        .and_then(|hex| MessageId::parse(hex).map_err(|e| StorageError::corrupt(member, e)))
}

/// `ZRANGE` stop index for a listing limit. `None` means nothing to fetch.
fn zrange_stop(limit: Option<usize>) -> Option<isize> {
    match limit {
        None => Some(-1),
        Some(0) => None,
        Some(l) => Some(isize::try_from(l - 1).unwrap_or(isize::MAX)),
    }
}

fn micros(at: DateTime<Utc>) -> Vec<u8> {
    at.timestamp_micros().to_string().into_bytes()
}

fn to_json<T: serde::Serialize>(id: MessageId, value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::corrupt(id, e))
}

/// Hash fields of a record. Optional fields are omitted when unset.
fn to_fields(record: &MessageRecord) -> Result<Vec<(&'static str, Vec<u8>)>, StorageError> {
    let mut fields = vec![
        ("id", record.id.to_hex().into_bytes()),
        ("member", index_member(record).into_bytes()),
        ("published_at", micros(record.published_at)),
        ("body", record.body.clone()),
        ("headers", to_json(record.id, &record.headers)?),
        ("properties", to_json(record.id, &record.properties)?),
        ("priority", record.priority.to_string().into_bytes()),
    ];
    if let Some(ttl) = record.time_to_live {
        fields.push(("time_to_live", micros(ttl)));
    }
    if let Some(until) = record.delayed_until {
        fields.push(("delayed_until", micros(until)));
    }
    if let Some(key) = &record.uniq_key {
        fields.push(("uniq_key", key.clone().into_bytes()));
    }
    if let Some(delivery_id) = record.delivery_id {
        fields.push(("delivery_id", delivery_id.to_hex().into_bytes()));
    }
    if let Some(after) = record.redeliver_after {
        fields.push(("redeliver_after", micros(after)));
    }
    Ok(fields)
}

/// Rebuild a record from its hash fields.
fn from_fields(mut fields: HashMap<String, Vec<u8>>) -> Result<MessageRecord, StorageError> {
    let raw_id = take_string(&mut fields, "id")?
        .ok_or_else(|| StorageError::corrupt("<unknown>", "record hash has no `id` field"))?;
    let id = MessageId::parse(&raw_id).map_err(|e| StorageError::corrupt(&raw_id, e))?;

    let published_at = take_time(&mut fields, id, "published_at")?
        .ok_or_else(|| StorageError::corrupt(id, "missing `published_at`"))?;
    let time_to_live = take_time(&mut fields, id, "time_to_live")?;
    let delayed_until = take_time(&mut fields, id, "delayed_until")?;
    let redeliver_after = take_time(&mut fields, id, "redeliver_after")?;

    let headers: Headers = match fields.remove("headers") {
        Some(raw) => serde_json::from_slice(&raw).map_err(|e| StorageError::corrupt(id, e))?,
        None => Headers::new(),
    };
    let properties: BTreeMap<String, serde_json::Value> = match fields.remove("properties") {
        Some(raw) => serde_json::from_slice(&raw).map_err(|e| StorageError::corrupt(id, e))?,
        None => BTreeMap::new(),
    };
    let priority = match take_string(&mut fields, "priority")? {
        Some(raw) => raw
            .parse()
            .map_err(|_| StorageError::corrupt(id, format!("invalid `priority`: {}", raw)))?,
        None => 0,
    };
    let delivery_id = match take_string(&mut fields, "delivery_id")? {
        Some(raw) => Some(
            DeliveryId::parse_hex(&raw)
                .ok_or_else(|| StorageError::corrupt(id, format!("invalid `delivery_id`: {}", raw)))?,
        ),
        None => None,
    };

    Ok(MessageRecord {
        id,
        published_at,
        body: fields.remove("body").unwrap_or_default(),
        headers,
        properties,
        priority,
        time_to_live,
        delayed_until,
        uniq_key: take_string(&mut fields, "uniq_key")?,
        delivery_id,
        redeliver_after,
    })
}

fn take_time(
    fields: &mut HashMap<String, Vec<u8>>,
    id: MessageId,
    name: &str,
) -> Result<Option<DateTime<Utc>>, StorageError> {
    let Some(raw) = take_string(fields, name)? else {
        return Ok(None);
    };
    let micros: i64 = raw
        .parse()
        .map_err(|_| StorageError::corrupt(id, format!("invalid `{}`: {}", name, raw)))?;
    DateTime::from_timestamp_micros(micros)
        .map(Some)
        .ok_or_else(|| StorageError::corrupt(id, format!("`{}` out of range", name)))
}

fn take_string(
    fields: &mut HashMap<String, Vec<u8>>,
    name: &str,
) -> Result<Option<String>, StorageError> {
    fields
        .remove(name)
        .map(|raw| {
            String::from_utf8(raw)
                .map_err(|_| StorageError::corrupt("<unknown>", format!("`{}` is not UTF-8", name)))
        })
        .transpose()
}

#[async_trait]
impl MessageStore for RedisStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    async fn setup(&self) -> Result<(), StorageError> {
        self.pool.ping().await?;

        let scripts = self.scripts.clone();
        self.pool
            .execute(|mut conn| async move {
                for script in scripts.all() {
                    let _: String = script.prepare_invoke().load_async(&mut conn).await?;
                }
                Ok(())
            })
            .await?;

        tracing::info!(
            namespace = %self.namespace(),
            url = %mask_password(self.pool.url()),
            "Redis queue scripts loaded"
        );
        Ok(())
    }

    async fn insert(&self, record: &MessageRecord) -> Result<(), StorageError> {
        let started = Instant::now();
        let fields = to_fields(record)?;
        let record_key = self.record_key(&record.id);
        let [queue, ready, delayed, leased, ttl] = self.index_keys();
        let member = index_member(record);
        let score = -(record.priority as f64);
        let uniq_key = record
            .uniq_key
            .as_ref()
            .map(|key| format!("{}{}", self.uniq_prefix(), key));

        // state index the record starts in, with its score
        let (state_key, state_score) = match (record.redeliver_after, record.delayed_until) {
            (Some(after), _) if record.is_leased() => (leased, after.timestamp_micros() as f64),
            (_, Some(until)) => (delayed, until.timestamp_micros() as f64),
            _ => (ready, score),
        };
        let expiry = record.time_to_live.map(|at| at.timestamp_micros() as f64);

        self.pool
            .execute(|mut conn| async move {
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .hset_multiple(&record_key, fields.as_slice())
                    .ignore()
                    .zadd(&queue, &member, score)
                    .ignore()
                    .zadd(&state_key, &member, state_score)
                    .ignore();
                if let Some(expiry) = expiry {
                    pipe.zadd(&ttl, &member, expiry).ignore();
                }
                if let Some(uniq_key) = &uniq_key {
                    pipe.sadd(uniq_key, &member).ignore();
                }
                let _: () = pipe.query_async(&mut conn).await?;
                Ok(())
            })
            .await?;

        self.observe("insert", started);
        tracing::trace!(
            message_id = %record.id,
            namespace = %self.namespace(),
            "Record inserted into Redis"
        );
        Ok(())
    }

    async fn find_unleased_by_uniq_key(
        &self,
        uniq_key: &str,
    ) -> Result<Option<MessageId>, StorageError> {
        let scripts = self.scripts.clone();
        let set_key = format!("{}{}", self.uniq_prefix(), uniq_key);
        let record_prefix = self.record_prefix();

        let found: Option<String> = self
            .pool
            .execute(|mut conn| async move {
                scripts
                    .find_unleased
                    .key(set_key)
                    .arg(record_prefix)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        found
            .map(|raw| MessageId::parse(&raw).map_err(|e| StorageError::corrupt(&raw, e)))
            .transpose()
    }

    async fn claim_next(&self, lease: &Lease) -> Result<Option<MessageRecord>, StorageError> {
        let started = Instant::now();
        let scripts = self.scripts.clone();
        let keys = self.index_keys();
        let record_prefix = self.record_prefix();
        let now = lease.now.timestamp_micros();
        let delivery_id = lease.delivery_id.to_hex();
        let redeliver_after = lease.redeliver_after.timestamp_micros();

        let claimed: Option<HashMap<String, Vec<u8>>> = self
            .pool
            .execute(|mut conn| async move {
                let mut invocation = with_index_keys(scripts.claim.prepare_invoke(), &keys);
                invocation
                    .arg(&record_prefix)
                    .arg(now)
                    .arg(&delivery_id)
                    .arg(redeliver_after);
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        self.observe("claim", started);

        match claimed {
            Some(fields) if !fields.is_empty() => from_fields(fields).map(Some),
            _ => Ok(None),
        }
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let scripts = self.scripts.clone();
        let keys = self.index_keys();
        let record_prefix = self.record_prefix();
        let uniq_prefix = self.uniq_prefix();
        let now = now.timestamp_micros();

        let removed: u64 = self
            .pool
            .execute(|mut conn| async move {
                let mut invocation = with_index_keys(scripts.sweep_expired.prepare_invoke(), &keys);
                invocation.arg(&record_prefix).arg(&uniq_prefix).arg(now);
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        Ok(removed)
    }

    async fn sweep_orphan_leases(&self, _now: DateTime<Utc>) -> Result<u64, StorageError> {
        // timed-out leases are reclaimed by the claim script
        Ok(0)
    }

    async fn delete(&self, id: &MessageId) -> Result<bool, StorageError> {
        let started = Instant::now();
        let scripts = self.scripts.clone();
        let keys = self.index_keys();
        let record_key = self.record_key(id);
        let uniq_prefix = self.uniq_prefix();

        let removed: u64 = self
            .pool
            .execute(|mut conn| async move {
                let mut invocation = with_index_keys(scripts.delete.prepare_invoke(), &keys);
                invocation.arg(&record_key).arg(&uniq_prefix);
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        self.observe("delete", started);
        Ok(removed > 0)
    }

    async fn list_all(&self, limit: Option<usize>) -> Result<Vec<MessageRecord>, StorageError> {
        let Some(stop) = zrange_stop(limit) else {
            return Ok(Vec::new());
        };
        let queue = self.index_key("queue");

        let members: Vec<String> = self
            .pool
            .execute(|mut conn| async move { conn.zrange(queue, 0, stop).await })
            .await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let keys = members
            .iter()
            .map(|member| id_from_member(member).map(|id| self.record_key(&id)))
            .collect::<Result<Vec<String>, StorageError>>()?;
        let hashes: Vec<HashMap<String, Vec<u8>>> = self
            .pool
            .execute(|mut conn| async move {
                let mut pipe = redis::pipe();
                for key in &keys {
                    pipe.hgetall(key);
                }
                pipe.query_async(&mut conn).await
            })
            .await?;

        hashes
            .into_iter()
            .filter(|fields| !fields.is_empty())
            .map(from_fields)
            .collect()
    }

    async fn find(&self, id: &MessageId) -> Result<Option<MessageRecord>, StorageError> {
        let record_key = self.record_key(id);
        let fields: HashMap<String, Vec<u8>> = self
            .pool
            .execute(|mut conn| async move { conn.hgetall(record_key).await })
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        from_fields(fields).map(Some)
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let queue = self.index_key("queue");
        let count: u64 = self
            .pool
            .execute(|mut conn| async move { conn.zcard(queue).await })
            .await?;
        Ok(count)
    }
}
