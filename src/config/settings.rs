use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Connection string selecting the backend, e.g. `postgres://u:p@host/db/messenger`
    #[serde(default = "default_dsn")]
    pub dsn: String,
    /// How long a claimed message stays invisible before it is redelivered
    #[serde(default = "default_lease_duration")]
    pub lease_duration_seconds: u64,
    /// Minimum time between two runs of the same maintenance sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    /// Consecutive retryable claim failures absorbed before escalating
    #[serde(default = "default_max_retryable_failures")]
    pub max_retryable_failures: u32,
    /// Key prefix for the Redis backend
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_dsn() -> String {
    "memory://default/messenger".to_string()
}

fn default_lease_duration() -> u64 {
    300 // 5 minutes
}

fn default_sweep_interval() -> u64 {
    1000
}

fn default_max_retryable_failures() -> u32 {
    3
}

fn default_redis_prefix() -> String {
    "leaseq".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_idle_timeout() -> u32 {
    600 // 10 minutes
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("queue.dsn", default_dsn())?
            .set_default("queue.lease_duration_seconds", default_lease_duration())?
            .set_default("queue.sweep_interval_ms", default_sweep_interval())?
            .set_default("queue.max_retryable_failures", default_max_retryable_failures())?
            .set_default("queue.redis_prefix", default_redis_prefix())?
            .set_default("logging.level", default_log_level())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // LEASEQ__QUEUE__DSN, LEASEQ__POSTGRES__POOL_SIZE, LEASEQ__LOGGING__JSON, ...
            .add_source(
                Environment::with_prefix("LEASEQ")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            dsn: default_dsn(),
            lease_duration_seconds: default_lease_duration(),
            sweep_interval_ms: default_sweep_interval(),
            max_retryable_failures: default_max_retryable_failures(),
            redis_prefix: default_redis_prefix(),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
