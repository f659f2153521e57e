mod settings;

pub use settings::{LoggingConfig, PostgresConfig, QueueSettings, Settings};
