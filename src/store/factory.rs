//! Store factory

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Settings;
use crate::dsn::{Dsn, StoreKind};
use crate::error::QueueError;
use crate::infrastructure::postgres::PostgresPool;
use crate::infrastructure::redis::RedisPool;

use super::memory_backend::MemoryStore;
use super::postgres_backend::PostgresStore;
use super::redis_backend::RedisStore;
use super::MessageStore;

/// A live connection that queues can share by name.
#[derive(Clone)]
pub enum RegisteredConnection {
    Postgres(PgPool),
    Redis(Arc<RedisPool>),
}

/// Connections addressable from a `connection://<name>/<table>` DSN.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, RegisteredConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, connection: RegisteredConnection) {
        self.connections.insert(name.into(), connection);
    }

    pub fn register_postgres(&mut self, name: impl Into<String>, pool: PgPool) {
        self.register(name, RegisteredConnection::Postgres(pool));
    }

    pub fn register_redis(&mut self, name: impl Into<String>, pool: Arc<RedisPool>) {
        self.register(name, RegisteredConnection::Redis(pool));
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredConnection> {
        self.connections.get(name)
    }
}

/// Create the store a DSN points at.
///
/// - `postgres://...`: opens a new pool sized by `settings.postgres`
/// - `redis://...`: opens a multiplexed connection, keys under `settings.queue.redis_prefix`
/// - `memory://...`: a fresh in-process store
/// - `connection://<name>/...`: reuses a connection from `registry`
///
/// No table is created here; call `setup()` on the store.
///
/// # Example
///
/// ```rust,ignore
/// let dsn = Dsn::parse(&settings.queue.dsn)?;
/// let store = connect_store(&dsn, &settings, None).await?;
/// ```
pub async fn connect_store(
    dsn: &Dsn,
    settings: &Settings,
    registry: Option<&ConnectionRegistry>,
) -> Result<Arc<dyn MessageStore>, QueueError> {
    match dsn.kind() {
        StoreKind::Postgres => {
            let pool = PostgresPool::connect(&dsn.driver_url(), &settings.postgres)
                .await
                .map_err(|e| QueueError::config(format!("cannot connect to {}: {}", dsn, e)))?;
            tracing::info!(
                backend = "postgres",
                table = %dsn.table(),
                url = %pool.database_url_masked(),
                "Creating PostgreSQL store"
            );
            Ok(Arc::new(PostgresStore::new(pool.pool().clone(), dsn.table())?))
        }
        StoreKind::Redis => {
            let pool = RedisPool::new(&dsn.driver_url())
                .map_err(|e| QueueError::config(format!("invalid Redis DSN {}: {}", dsn, e)))?;
            tracing::info!(
                backend = "redis",
                prefix = %settings.queue.redis_prefix,
                collection = %dsn.table(),
                "Creating Redis store"
            );
            Ok(Arc::new(RedisStore::new(
                Arc::new(pool),
                settings.queue.redis_prefix.clone(),
                dsn.table(),
            )?))
        }
        StoreKind::Memory => {
            tracing::info!(backend = "memory", collection = %dsn.table(), "Creating memory store");
            Ok(Arc::new(MemoryStore::new(dsn.table())))
        }
        StoreKind::Named(name) => {
            let registry = registry.ok_or_else(|| {
                QueueError::config(format!(
                    "DSN names connection `{}` but no connection registry was provided",
                    name
                ))
            })?;
            let connection = registry.get(name).ok_or_else(|| {
                QueueError::config(format!("no connection registered under `{}`", name))
            })?;

            match connection {
                RegisteredConnection::Postgres(pool) => {
                    tracing::info!(
                        backend = "postgres",
                        connection = %name,
                        table = %dsn.table(),
                        "Creating PostgreSQL store on registered connection"
                    );
                    Ok(Arc::new(PostgresStore::new(pool.clone(), dsn.table())?))
                }
                RegisteredConnection::Redis(pool) => {
                    tracing::info!(
                        backend = "redis",
                        connection = %name,
                        collection = %dsn.table(),
                        "Creating Redis store on registered connection"
                    );
                    Ok(Arc::new(RedisStore::new(
                        pool.clone(),
                        settings.queue.redis_prefix.clone(),
                        dsn.table(),
                    )?))
                }
            }
        }
    }
}
