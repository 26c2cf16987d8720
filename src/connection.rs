//! A pooled connection's state: the driver handle plus the statements
//! prepared on it.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::driver::{DriverConnection, DriverErrorKind, DriverResult};
use crate::statement::{PreparedStatement, StatementCache};
use crate::value::{QueryResult, Value};

/// Identity of one physical connection, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// An open connection owned by the pool.
///
/// Statement handles are connection-scoped, so the statement cache lives
/// here and is dropped together with the connection when it is retired.
pub struct Connection {
    id: ConnectionId,
    raw: Box<dyn DriverConnection>,
    statements: StatementCache,
    created_at: Instant,
    /// Set while a statement is running; a connection dropped in this state
    /// may be mid-protocol and is never reused.
    in_flight: bool,
    /// Set between a successful BEGIN and the matching COMMIT/ROLLBACK.
    in_transaction: bool,
    /// Set when the driver reported the link itself as gone.
    broken: bool,
}

impl Connection {
    pub(crate) fn new(raw: Box<dyn DriverConnection>, statement_cache_capacity: usize) -> Self {
        Self {
            id: ConnectionId::new(),
            raw,
            statements: StatementCache::new(statement_cache_capacity),
            created_at: Instant::now(),
            in_flight: false,
            in_transaction: false,
            broken: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn statement_cache(&self) -> &StatementCache {
        &self.statements
    }

    /// Whether the connection may go back to the idle set.
    pub fn is_reusable(&self) -> bool {
        !self.in_flight && !self.in_transaction && !self.broken && !self.raw.is_closed()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Get the prepared statement for `sql`, preparing it on a cache miss.
    pub async fn prepared(&mut self, sql: &str) -> DriverResult<Arc<PreparedStatement>> {
        if let Some(stmt) = self.statements.get(sql) {
            return Ok(stmt);
        }

        let name = self.statements.next_statement_name();
        self.in_flight = true;
        let result = self.raw.prepare(&name, sql).await;
        let stmt = Arc::new(self.settle(result)?);

        if let Some(evicted) = self.statements.insert(Arc::clone(&stmt)) {
            if let Err(e) = self.raw.release_statement(&evicted).await {
                tracing::debug!(connection_id = %self.id, statement = %evicted, error = %e, "failed to release evicted statement");
            }
        }
        Ok(stmt)
    }

    pub async fn query_prepared(
        &mut self,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> DriverResult<QueryResult> {
        self.in_flight = true;
        let result = self.raw.query(stmt, params).await;
        self.settle(result)
    }

    pub async fn execute_prepared(&mut self, stmt: &PreparedStatement, params: &[Value]) -> DriverResult<u64> {
        self.in_flight = true;
        let result = self.raw.execute(stmt, params).await;
        self.settle(result)
    }

    /// Prepare (or reuse) and run a row-returning statement.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> DriverResult<QueryResult> {
        let stmt = self.prepared(sql).await?;
        self.query_prepared(&stmt, params).await
    }

    /// Prepare (or reuse) and run a statement, returning rows affected.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<u64> {
        let stmt = self.prepared(sql).await?;
        self.execute_prepared(&stmt, params).await
    }

    pub async fn batch(&mut self, sql: &str) -> DriverResult<()> {
        self.in_flight = true;
        let result = self.raw.batch(sql).await;
        self.settle(result)
    }

    pub async fn begin(&mut self) -> DriverResult<()> {
        self.in_flight = true;
        let result = self.raw.begin().await;
        self.settle(result)?;
        self.in_transaction = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> DriverResult<()> {
        self.in_flight = true;
        let result = self.raw.commit().await;
        self.settle(result)?;
        self.in_transaction = false;
        Ok(())
    }

    pub async fn rollback(&mut self) -> DriverResult<()> {
        self.in_flight = true;
        let result = self.raw.rollback().await;
        self.settle(result)?;
        self.in_transaction = false;
        Ok(())
    }

    pub async fn ping(&mut self) -> DriverResult<()> {
        self.in_flight = true;
        let result = self.raw.ping().await;
        self.settle(result)
    }

    /// Close the connection, dropping its prepared statements.
    pub async fn close(mut self) -> DriverResult<()> {
        self.statements.clear();
        self.raw.close().await
    }

    pub(crate) fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Clear `in_flight` once a driver call completes. A call whose future is
    /// dropped never reaches this, leaving the flag set.
    fn settle<T>(&mut self, result: DriverResult<T>) -> DriverResult<T> {
        self.in_flight = false;
        if let Err(e) = &result {
            if matches!(e.kind, DriverErrorKind::ConnectionReset | DriverErrorKind::Closed) {
                self.broken = true;
            }
        }
        result
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("statements", &self.statements.len())
            .field("in_flight", &self.in_flight)
            .field("in_transaction", &self.in_transaction)
            .field("broken", &self.broken)
            .finish()
    }
}
