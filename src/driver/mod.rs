//! Datastore drivers.
//!
//! The rest of the crate only sees the datastore through two traits:
//! - `Connector`: opens new connections (owned by the pool)
//! - `DriverConnection`: prepares and runs statements on one connection
//!
//! Architecture:
//! - `error`: driver errors and transient/permanent classification
//! - `sqlite`: SQLite driver on rusqlite + tokio-rusqlite

pub mod error;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod fault;

use async_trait::async_trait;

use crate::statement::PreparedStatement;
use crate::value::{QueryResult, Value};

// Public API re-exports for library consumers
pub use error::{DriverError, DriverErrorKind, DriverResult, ErrorClass};
pub use sqlite::{SqliteConnection, SqliteConnector};

/// Opens connections to a datastore.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new, ready-to-use connection.
    async fn connect(&self) -> DriverResult<Box<dyn DriverConnection>>;

    /// Endpoint description for logs. Must not contain credentials.
    fn describe(&self) -> String;
}

/// One established connection.
#[async_trait]
pub trait DriverConnection: Send + 'static {
    /// Compile `sql` under the connection-local `name`.
    async fn prepare(&mut self, name: &str, sql: &str) -> DriverResult<PreparedStatement>;

    /// Run a prepared statement and collect its rows.
    async fn query(&mut self, stmt: &PreparedStatement, params: &[Value]) -> DriverResult<QueryResult>;

    /// Run a prepared statement and return the number of rows affected.
    async fn execute(&mut self, stmt: &PreparedStatement, params: &[Value]) -> DriverResult<u64>;

    /// Run one or more unprepared statements (transaction control, DDL).
    async fn batch(&mut self, sql: &str) -> DriverResult<()>;

    /// Cheap liveness probe.
    async fn ping(&mut self) -> DriverResult<()>;

    /// Release a statement evicted from the connection's cache.
    async fn release_statement(&mut self, _name: &str) -> DriverResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> DriverResult<()>;

    fn is_closed(&self) -> bool;

    async fn begin(&mut self) -> DriverResult<()> {
        self.batch("BEGIN").await
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.batch("COMMIT").await
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.batch("ROLLBACK").await
    }
}
