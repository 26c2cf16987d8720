//! storekit - resilient datastore access and result caching for async
//! services.
//!
//! Request handlers go through a [`Database`] handle, which owns:
//! - a bounded connection pool with health checks and idle reaping
//! - an execution engine that retries transient failures with backoff
//! - a transaction coordinator for atomic statement batches
//! - a TTL + LRU result cache invalidated by table name on writes
//! - a scheduler that refreshes aggregate views in the background
//!
//! The datastore is reached through the [`driver::Connector`] and
//! [`driver::DriverConnection`] traits; a SQLite driver ships with the
//! crate. All connections of a pool over `sqlite::memory:` share one
//! private in-memory database.

pub mod cache;
pub mod config;
pub mod connection;
pub mod database;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod pool;
pub mod retry;
pub mod scheduler;
pub mod statement;
pub mod transaction;
pub mod value;

#[cfg(test)]
mod testing;

pub use cache::{CacheConfig, CacheStatistics, ResultCache};
pub use config::StoreConfig;
pub use database::Database;
pub use engine::Engine;
pub use error::{Result, StoreError};
pub use events::{Event, EventKind, EventSink};
pub use pool::{ConnectionPool, PoolConfig, PoolStatus, PooledConnection};
pub use retry::RetryPolicy;
pub use scheduler::{RefreshScheduler, RefreshStatus, ViewRefresh};
pub use transaction::{TransactionCoordinator, TxStatement};
pub use value::{Row, SharedRows, Value};
