//! Redis connection handling.

pub mod pool;

pub use pool::RedisPool;
