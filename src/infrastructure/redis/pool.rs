//! Redis connection pool for the Redis store.
//!
//! Keeps one multiplexed connection shared by every task and re-establishes
//! it after the server drops it.

use std::future::Future;

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult};
use tokio::sync::RwLock;

/// Redis connection pool for data operations.
///
/// Commands are pipelined over a single multiplexed connection, so cloning
/// the handed-out connection is cheap and safe across tasks.
pub struct RedisPool {
    /// Redis client for creating connections
    client: Client,

    /// Multiplexed connection (shared across tasks)
    connection: RwLock<Option<MultiplexedConnection>>,

    /// Connection URL
    url: String,
}

impl RedisPool {
    /// Create a new Redis pool. No connection is opened until first use.
    pub fn new(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            url: url.to_string(),
        })
    }

    /// Get a connection from the pool.
    ///
    /// This will establish a new connection if none exists.
    pub async fn get_connection(&self) -> RedisResult<MultiplexedConnection> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    /// Establish a new connection.
    async fn connect(&self) -> RedisResult<MultiplexedConnection> {
        let mut conn_guard = self.connection.write().await;

        // Double-check in case another task connected while we waited
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                tracing::info!("Redis pool connection established");
                Ok(conn)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(e)
            }
        }
    }

    /// Run `f` on a pooled connection.
    ///
    /// A dropped connection is discarded so the next call reconnects.
    pub async fn execute<F, T, Fut>(&self, f: F) -> RedisResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    let mut conn_guard = self.connection.write().await;
                    *conn_guard = None;
                    tracing::warn!(error = %e, "Redis connection lost, will reconnect on next use");
                }
                Err(e)
            }
        }
    }

    /// Get the Redis URL (for debugging).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Ping Redis to check connectivity.
    pub async fn ping(&self) -> RedisResult<()> {
        self.execute(|mut conn| async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}
