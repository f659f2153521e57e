//! PostgreSQL-based queue store.
//!
//! One row per message. Claiming is a two-step protocol: select the first
//! claimable id, then lease it with an UPDATE guarded by
//! `delivery_id IS NULL`. A consumer that loses the race between the two
//! statements updates zero rows and reports an empty poll.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::codec::Headers;
use crate::error::{QueueError, StorageError};
use crate::metrics::BackendMetrics;

use super::{DeliveryId, Lease, MessageId, MessageRecord, MessageStore};

const BACKEND: &str = "postgres";
const MAX_IDENTIFIER_LEN: usize = 63;

/// Whether `name` can be used as an unquoted-style SQL identifier.
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    starts_ok
        && name.len() <= MAX_IDENTIFIER_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A row of the queue table.
#[derive(Debug, FromRow)]
struct RecordRow {
    id: Vec<u8>,
    published_at: DateTime<Utc>,
    body: Vec<u8>,
    headers: Json<Headers>,
    properties: Json<BTreeMap<String, serde_json::Value>>,
    priority: i32,
    time_to_live: Option<DateTime<Utc>>,
    delayed_until: Option<DateTime<Utc>>,
    uniq_key: Option<String>,
    delivery_id: Option<Vec<u8>>,
    redeliver_after: Option<DateTime<Utc>>,
}

impl TryFrom<RecordRow> for MessageRecord {
    type Error = StorageError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let id = MessageId::from_slice(&row.id)
            .map_err(|e| StorageError::corrupt(hex::encode(&row.id), e))?;
        let delivery_id = row
            .delivery_id
            .as_deref()
            .map(DeliveryId::from_slice)
            .transpose()
            .map_err(|e| StorageError::corrupt(id, e))?;

        Ok(MessageRecord {
            id,
            published_at: row.published_at,
            body: row.body,
            headers: row.headers.0,
            properties: row.properties.0,
            priority: row.priority,
            time_to_live: row.time_to_live,
            delayed_until: row.delayed_until,
            uniq_key: row.uniq_key,
            delivery_id,
            redeliver_after: row.redeliver_after,
        })
    }
}

/// PostgreSQL-based queue store.
///
/// Table structure (`{table}`):
/// - `id BYTEA` primary key, 16 bytes
/// - `delivery_id BYTEA` lease token, 16 bytes, indexed
/// - `priority`, `uniq_key` indexed
#[derive(Clone)]
pub struct PostgresStore {
    /// PostgreSQL connection pool
    pool: PgPool,

    /// Queue table name, validated at construction
    table: String,
}

impl PostgresStore {
    /// Create a store over an existing pool.
    ///
    /// Fails if `table` is not a plain SQL identifier.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, QueueError> {
        let table = table.into();
        if !is_valid_table_name(&table) {
            return Err(QueueError::config(format!(
                "invalid table name `{}`: expected [A-Za-z_][A-Za-z0-9_]*, at most {} chars",
                table, MAX_IDENTIFIER_LEN
            )));
        }
        Ok(Self { pool, table })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn schema_statements(&self) -> Vec<String> {
        let t = &self.table;
        vec![
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS "{t}" (
                    id BYTEA NOT NULL CHECK (octet_length(id) = 16),
                    published_at TIMESTAMPTZ NOT NULL,
                    body BYTEA NOT NULL,
                    headers JSONB NOT NULL,
                    properties JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    priority INTEGER NOT NULL DEFAULT 0,
                    time_to_live TIMESTAMPTZ NULL,
                    delayed_until TIMESTAMPTZ NULL,
                    uniq_key VARCHAR(70) NULL,
                    delivery_id BYTEA NULL CHECK (octet_length(delivery_id) = 16),
                    redeliver_after TIMESTAMPTZ NULL,
                    PRIMARY KEY (id)
                )
                "#
            ),
            format!(r#"CREATE INDEX IF NOT EXISTS "{t}_delivery_id_idx" ON "{t}" (delivery_id)"#),
            format!(r#"CREATE INDEX IF NOT EXISTS "{t}_priority_idx" ON "{t}" (priority)"#),
            format!(r#"CREATE INDEX IF NOT EXISTS "{t}_uniq_key_idx" ON "{t}" (uniq_key)"#),
        ]
    }

    fn observe(&self, operation: &str, started: Instant) {
        BackendMetrics::record_latency(BACKEND, operation, started.elapsed().as_secs_f64());
    }
}

/// `LIMIT` bind value. Limits beyond `i64::MAX` saturate.
fn sql_limit(limit: Option<usize>) -> Option<i64> {
    limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX))
}

#[async_trait]
impl MessageStore for PostgresStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn collection(&self) -> &str {
        &self.table
    }

    async fn setup(&self) -> Result<(), StorageError> {
        for statement in self.schema_statements() {
            sqlx::query(&statement).execute(&self.pool).await?;
        }

        tracing::info!(table = %self.table, "PostgreSQL queue table ready");
        Ok(())
    }

    async fn insert(&self, record: &MessageRecord) -> Result<(), StorageError> {
        let started = Instant::now();
        let sql = format!(
            r#"
            INSERT INTO "{}" (id, published_at, body, headers, properties, priority,
                              time_to_live, delayed_until, uniq_key, delivery_id, redeliver_after)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
            self.table
        );

        sqlx::query(&sql)
            .bind(record.id.as_bytes().as_slice())
            .bind(record.published_at)
            .bind(&record.body)
            .bind(Json(&record.headers))
            .bind(Json(&record.properties))
            .bind(record.priority)
            .bind(record.time_to_live)
            .bind(record.delayed_until)
            .bind(record.uniq_key.as_deref())
            .bind(record.delivery_id.map(|d| d.as_bytes().to_vec()))
            .bind(record.redeliver_after)
            .execute(&self.pool)
            .await?;

        self.observe("insert", started);
        tracing::trace!(message_id = %record.id, table = %self.table, "Record inserted into PostgreSQL");
        Ok(())
    }

    async fn find_unleased_by_uniq_key(
        &self,
        uniq_key: &str,
    ) -> Result<Option<MessageId>, StorageError> {
        let sql = format!(
            r#"SELECT id FROM "{}" WHERE uniq_key = $1 AND delivery_id IS NULL LIMIT 1"#,
            self.table
        );

        let id: Option<Vec<u8>> = sqlx::query_scalar(&sql)
            .bind(uniq_key)
            .fetch_optional(&self.pool)
            .await?;

        id.map(|bytes| {
            MessageId::from_slice(&bytes).map_err(|e| StorageError::corrupt(hex::encode(&bytes), e))
        })
        .transpose()
    }

    async fn claim_next(&self, lease: &Lease) -> Result<Option<MessageRecord>, StorageError> {
        let started = Instant::now();

        let select = format!(
            r#"
            SELECT id FROM "{}"
            WHERE delivery_id IS NULL
              AND (delayed_until IS NULL OR delayed_until <= $1)
            ORDER BY priority DESC, published_at ASC, id ASC
            LIMIT 1
            "#,
            self.table
        );
        let candidate: Option<Vec<u8>> = sqlx::query_scalar(&select)
            .bind(lease.now)
            .fetch_optional(&self.pool)
            .await?;

        let Some(candidate) = candidate else {
            self.observe("claim", started);
            return Ok(None);
        };

        let update = format!(
            r#"
            UPDATE "{}"
            SET delivery_id = $1, redeliver_after = $2
            WHERE id = $3 AND delivery_id IS NULL
            "#,
            self.table
        );
        let leased = sqlx::query(&update)
            .bind(lease.delivery_id.as_bytes().as_slice())
            .bind(lease.redeliver_after)
            .bind(&candidate)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if leased == 0 {
            tracing::debug!(
                candidate = %hex::encode(&candidate),
                "Lost claim race, another consumer leased the record"
            );
            self.observe("claim", started);
            return Ok(None);
        }

        let fetch = format!(r#"SELECT * FROM "{}" WHERE delivery_id = $1 LIMIT 1"#, self.table);
        let row: Option<RecordRow> = sqlx::query_as(&fetch)
            .bind(lease.delivery_id.as_bytes().as_slice())
            .fetch_optional(&self.pool)
            .await?;

        self.observe("claim", started);

        match row {
            Some(row) => MessageRecord::try_from(row).map(Some),
            None => {
                // removed by a third party (truncate, manual delete) after the lease
                tracing::debug!(delivery_id = %lease.delivery_id, "Leased record vanished before fetch");
                Ok(None)
            }
        }
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let sql = format!(
            r#"
            DELETE FROM "{}"
            WHERE time_to_live IS NOT NULL AND time_to_live <= $1
              AND delivery_id IS NULL
            "#,
            self.table
        );
        let result = sqlx::query(&sql).bind(now).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn sweep_orphan_leases(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let sql = format!(
            r#"
            UPDATE "{}"
            SET delivery_id = NULL, redeliver_after = NULL
            WHERE delivery_id IS NOT NULL AND redeliver_after < $1
            "#,
            self.table
        );
        let result = sqlx::query(&sql).bind(now).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, id: &MessageId) -> Result<bool, StorageError> {
        let started = Instant::now();
        let sql = format!(r#"DELETE FROM "{}" WHERE id = $1"#, self.table);
        let result = sqlx::query(&sql)
            .bind(id.as_bytes().as_slice())
            .execute(&self.pool)
            .await?;
        self.observe("delete", started);
        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self, limit: Option<usize>) -> Result<Vec<MessageRecord>, StorageError> {
        // LIMIT NULL means no limit
        let sql = format!(
            r#"SELECT * FROM "{}" ORDER BY priority DESC, published_at ASC, id ASC LIMIT $1"#,
            self.table
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(MessageRecord::try_from).collect()
    }

    async fn find(&self, id: &MessageId) -> Result<Option<MessageRecord>, StorageError> {
        let sql = format!(r#"SELECT * FROM "{}" WHERE id = $1 LIMIT 1"#, self.table);
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(id.as_bytes().as_slice())
            .fetch_optional(&self.pool)
            .await?;

        row.map(MessageRecord::try_from).transpose()
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let sql = format!(r#"SELECT COUNT(*) FROM "{}""#, self.table);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(is_valid_table_name("messenger"));
        assert!(is_valid_table_name("_queue_2"));
        assert!(!is_valid_table_name(""));
        assert!(!is_valid_table_name("2fast"));
        assert!(!is_valid_table_name("drop table; --"));
        assert!(!is_valid_table_name("with\"quote"));
        assert!(!is_valid_table_name(&"a".repeat(64)));
    }

    #[test]
    fn test_row_conversion() {
        let id = MessageId::generate();
        let delivery = DeliveryId::generate();
        let now = Utc::now();

        let row = RecordRow {
            id: id.as_bytes().to_vec(),
            published_at: now,
            body: b"{}".to_vec(),
            headers: Json(Headers::from([("type".to_string(), "t".to_string())])),
            properties: Json(BTreeMap::new()),
            priority: 3,
            time_to_live: None,
            delayed_until: Some(now),
            uniq_key: Some("k".to_string()),
            delivery_id: Some(delivery.as_bytes().to_vec()),
            redeliver_after: Some(now),
        };

        let record = MessageRecord::try_from(row).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.delivery_id, Some(delivery));
        assert_eq!(record.priority, 3);
        assert_eq!(record.uniq_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_row_conversion_rejects_short_id() {
        let row = RecordRow {
            id: vec![1, 2, 3],
            published_at: Utc::now(),
            body: Vec::new(),
            headers: Json(Headers::new()),
            properties: Json(BTreeMap::new()),
            priority: 0,
            time_to_live: None,
            delayed_until: None,
            uniq_key: None,
            delivery_id: None,
            redeliver_after: None,
        };

        assert!(matches!(
            MessageRecord::try_from(row),
            Err(StorageError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_sql_limit_saturates() {
        assert_eq!(sql_limit(None), None);
        assert_eq!(sql_limit(Some(25)), Some(25));
        assert_eq!(sql_limit(Some(usize::MAX)), Some(i64::MAX));
    }
}
