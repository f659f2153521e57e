//! Infrastructure layer modules
//!
//! Shared connection plumbing for the datastore-backed stores:
//! - `postgres`: PostgreSQL connection pool
//! - `redis`: multiplexed Redis connection with reconnect on drop

pub mod postgres;
pub mod redis;
