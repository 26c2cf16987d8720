//! Connection pool.
//!
//! A semaphore bounds the number of connections lent out at once; idle
//! connections wait in a `parking_lot` protected stack. Every idle connection
//! is pinged before it is handed out, and a background reaper closes
//! connections that sat idle for longer than `idle_timeout`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionId};
use crate::driver::{Connector, DriverResult};
use crate::error::{Result, StoreError};
use crate::events::{EventKind, Events};
use crate::statement::PreparedStatement;
use crate::value::{QueryResult, Value};

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Connections opened at startup and kept open by the reaper
    pub min_connections: u32,
    /// Maximum number of connections lent out at once
    pub max_connections: u32,
    /// Idle connections unused for longer than this are closed
    pub idle_timeout: Duration,
    /// Bound on opening a single connection
    pub connect_timeout: Duration,
    /// Default wait for a free connection
    pub acquire_timeout: Duration,
    /// How often the reaper looks for stale idle connections
    pub reap_interval: Duration,
    /// Statement cache capacity per connection
    pub statement_cache_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(30),
            statement_cache_capacity: 100,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or in use
    pub size: u32,
    pub idle: usize,
    pub in_use: usize,
    pub max: u32,
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is returned to the pool, or closed if the
/// pool is shutting down or the connection can no longer be trusted.
pub struct PooledConnection {
    /// The actual connection (None once returned to the pool)
    conn: Option<Connection>,
    /// Reference back to the pool
    pool: Arc<PoolInner>,
    /// Semaphore permit (controls pool size)
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn conn_mut(&mut self) -> DriverResult<&mut Connection> {
        self.conn.as_mut().ok_or_else(crate::driver::DriverError::closed)
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.conn.as_ref().map(Connection::id)
    }

    pub async fn prepared(&mut self, sql: &str) -> DriverResult<Arc<PreparedStatement>> {
        self.conn_mut()?.prepared(sql).await
    }

    pub async fn query_prepared(&mut self, stmt: &PreparedStatement, params: &[Value]) -> DriverResult<QueryResult> {
        self.conn_mut()?.query_prepared(stmt, params).await
    }

    pub async fn execute_prepared(&mut self, stmt: &PreparedStatement, params: &[Value]) -> DriverResult<u64> {
        self.conn_mut()?.execute_prepared(stmt, params).await
    }

    pub async fn query(&mut self, sql: &str, params: &[Value]) -> DriverResult<QueryResult> {
        self.conn_mut()?.query(sql, params).await
    }

    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<u64> {
        self.conn_mut()?.execute(sql, params).await
    }

    pub async fn batch(&mut self, sql: &str) -> DriverResult<()> {
        self.conn_mut()?.batch(sql).await
    }

    pub async fn begin(&mut self) -> DriverResult<()> {
        self.conn_mut()?.begin().await
    }

    pub async fn commit(&mut self) -> DriverResult<()> {
        self.conn_mut()?.commit().await
    }

    pub async fn rollback(&mut self) -> DriverResult<()> {
        self.conn_mut()?.rollback().await
    }

    /// Number of statements prepared on this connection.
    pub fn prepared_count(&self) -> usize {
        self.conn.as_ref().map(|c| c.statement_cache().len()).unwrap_or(0)
    }

    /// Close this connection instead of returning it to the pool.
    pub fn discard(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.mark_broken();
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct IdleConnection {
    conn: Connection,
    idle_since: Instant,
}

/// A connection counted in the pool's size that is neither idle nor lent
/// out, e.g. while it is being health-checked or closed.
///
/// Dropping the guard retires the connection, so a cancelled `acquire`,
/// reap or close never leaves `size` counting a connection that is gone.
struct InTransit<'a> {
    pool: &'a PoolInner,
    conn: Option<Connection>,
    reason: &'static str,
}

impl<'a> InTransit<'a> {
    fn new(pool: &'a PoolInner, conn: Connection, reason: &'static str) -> Self {
        Self {
            pool,
            conn: Some(conn),
            reason,
        }
    }

    fn conn_mut(&mut self) -> Option<&mut Connection> {
        self.conn.as_mut()
    }

    /// Take the connection back, disarming the guard.
    fn into_inner(mut self) -> Option<Connection> {
        self.conn.take()
    }
}

impl Drop for InTransit<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.retire_detached(conn, self.reason);
        }
    }
}

/// Internal pool state.
struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    /// Idle connections waiting to be used (most recently returned at the back)
    idle: Mutex<VecDeque<IdleConnection>>,
    /// Semaphore to limit connections in use
    semaphore: Arc<Semaphore>,
    /// Open connections, idle or lent out
    size: AtomicU32,
    closing: AtomicBool,
    events: Events,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    /// Return a connection to the idle set, or retire it.
    fn checkin(&self, conn: Connection) {
        if self.closing.load(Ordering::Acquire) {
            self.retire_detached(conn, "pool closing");
        } else if !conn.is_reusable() {
            self.retire_detached(conn, "connection unusable");
        } else if self.size.load(Ordering::Acquire) > self.config.max_connections {
            self.retire_detached(conn, "pool over capacity");
        } else {
            self.idle.lock().push_back(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
        }
    }

    fn note_retired(&self, id: ConnectionId, reason: &str) {
        self.size.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(connection_id = %id, reason, "retired connection");
        self.events.emit(
            EventKind::ConnectionRetired,
            json!({ "connection_id": id.to_string(), "reason": reason }),
        );
    }

    /// Close a connection. It stops counting towards `size` before the
    /// close is awaited.
    async fn retire(&self, conn: Connection, reason: &str) {
        let id = conn.id();
        self.note_retired(id, reason);
        if let Err(e) = conn.close().await {
            tracing::debug!(connection_id = %id, error = %e, "error closing connection");
        }
    }

    async fn retire_all(&self, connections: Vec<InTransit<'_>>) {
        for guard in connections {
            let reason = guard.reason;
            if let Some(conn) = guard.into_inner() {
                self.retire(conn, reason).await;
            }
        }
    }

    /// Retire from a synchronous context (e.g. `Drop`).
    fn retire_detached(&self, conn: Connection, reason: &str) {
        let id = conn.id();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.close().await {
                        tracing::debug!(connection_id = %id, error = %e, "error closing connection");
                    }
                });
            }
            // No runtime left: dropping the driver handle releases it
            Err(_) => drop(conn),
        }
        self.note_retired(id, reason);
    }

    async fn open(&self) -> Result<Connection> {
        let timeout = self.config.connect_timeout;
        let raw = match tokio::time::timeout(timeout, self.connector.connect()).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                tracing::warn!(endpoint = %self.connector.describe(), error = %e, "failed to open connection");
                return Err(StoreError::from_driver(e));
            }
            Err(_) => {
                tracing::warn!(endpoint = %self.connector.describe(), ?timeout, "timed out opening connection");
                return Err(StoreError::ConnectTimeout(timeout));
            }
        };

        let conn = Connection::new(raw, self.config.statement_cache_capacity);
        let size = self.size.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(connection_id = %conn.id(), size, "opened connection");
        self.events.emit(
            EventKind::ConnectionOpened,
            json!({ "connection_id": conn.id().to_string(), "size": size }),
        );
        Ok(conn)
    }

    async fn health_check(&self, conn: &mut Connection) -> bool {
        if !conn.is_reusable() {
            return false;
        }
        match tokio::time::timeout(self.config.connect_timeout, conn.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "health check failed");
                false
            }
            Err(_) => {
                tracing::debug!(connection_id = %conn.id(), "health check timed out");
                false
            }
        }
    }

    /// Close idle connections past `idle_timeout`, keeping `min_connections` open.
    async fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let min = self.config.min_connections;
        let stale: Vec<InTransit<'_>> = {
            let mut idle = self.idle.lock();
            let mut stale = Vec::new();
            // Oldest idle connections sit at the front
            while let Some(front) = idle.front() {
                let open = self.size.load(Ordering::Acquire).saturating_sub(stale.len() as u32);
                if front.idle_since.elapsed() < idle_timeout || open <= min {
                    break;
                }
                if let Some(entry) = idle.pop_front() {
                    stale.push(InTransit::new(self, entry.conn, "idle timeout"));
                }
            }
            stale
        };

        let reaped = stale.len();
        self.retire_all(stale).await;
        reaped
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A bounded pool of datastore connections.
///
/// Each connection carries its own prepared statement cache.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool, opening `min_connections` up front.
    pub async fn connect(connector: Arc<dyn Connector>, config: PoolConfig, events: Events) -> Result<Self> {
        if config.max_connections == 0 || config.min_connections > config.max_connections {
            return Err(StoreError::Config(format!(
                "invalid pool bounds: min={} max={}",
                config.min_connections, config.max_connections
            )));
        }

        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            connector,
            config,
            idle: Mutex::new(VecDeque::new()),
            size: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            events,
            reaper: Mutex::new(None),
        });

        let pool = Self { inner };

        // Pre-create minimum connections
        for _ in 0..pool.inner.config.min_connections {
            let conn = pool.inner.open().await?;
            pool.inner.idle.lock().push_back(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
        }

        pool.spawn_reaper();
        tracing::info!(
            endpoint = %pool.inner.connector.describe(),
            min = pool.inner.config.min_connections,
            max = pool.inner.config.max_connections,
            "connection pool ready"
        );
        Ok(pool)
    }

    fn spawn_reaper(&self) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.reap_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closing.load(Ordering::Acquire) {
                    break;
                }
                let reaped = inner.reap_idle().await;
                if reaped > 0 {
                    tracing::debug!(reaped, "closed idle connections");
                }
            }
        });
        *self.inner.reaper.lock() = Some(handle);
    }

    /// Get a connection, waiting up to the configured `acquire_timeout`.
    pub async fn get(&self) -> Result<PooledConnection> {
        self.acquire(self.inner.config.acquire_timeout).await
    }

    /// Get a connection from the pool, waiting at most `timeout` for one to
    /// become free.
    ///
    /// Idle connections are health-checked first; a failing one is retired
    /// and the next one (or a fresh connection) is tried instead.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection> {
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(StoreError::PoolClosed);
        }

        let permit = match tokio::time::timeout(timeout, Arc::clone(&self.inner.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(StoreError::PoolClosed),
            Err(_) => {
                let status = self.status();
                tracing::warn!(waited = ?timeout, in_use = status.in_use, max = status.max, "connection pool exhausted");
                self.inner.events.emit(
                    EventKind::PoolExhausted,
                    json!({ "waited_ms": timeout.as_millis() as u64, "in_use": status.in_use, "max": status.max }),
                );
                return Err(StoreError::PoolExhausted { waited: timeout });
            }
        };

        loop {
            let candidate = self.inner.idle.lock().pop_back();
            let Some(IdleConnection { conn, .. }) = candidate else {
                break;
            };
            let mut guard = InTransit::new(&self.inner, conn, "acquire abandoned");
            let healthy = match guard.conn_mut() {
                Some(conn) => self.inner.health_check(conn).await,
                None => false,
            };
            let Some(conn) = guard.into_inner() else { continue };
            if healthy {
                return Ok(self.lend(conn, permit));
            }
            self.inner.retire(conn, "failed health check").await;
        }

        let conn = self.inner.open().await?;
        Ok(self.lend(conn, permit))
    }

    fn lend(&self, conn: Connection, permit: OwnedSemaphorePermit) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    /// Return a connection to the pool. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Ping a connection. Unhealthy connections are marked so they are
    /// retired on release.
    pub async fn health_check(&self, conn: &mut PooledConnection) -> bool {
        let Ok(inner) = conn.conn_mut() else {
            return false;
        };
        let healthy = self.inner.health_check(inner).await;
        if !healthy {
            conn.discard();
        }
        healthy
    }

    /// Close idle connections past `idle_timeout` now, without waiting for
    /// the reaper. Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        self.inner.reap_idle().await
    }

    /// Close the pool and all idle connections.
    ///
    /// Connections still lent out are closed as they are released. Callers
    /// waiting in `acquire` fail with `PoolClosed`.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();
        if let Some(reaper) = self.inner.reaper.lock().take() {
            reaper.abort();
        }

        let connections: Vec<InTransit<'_>> = {
            let mut idle = self.inner.idle.lock();
            idle.drain(..)
                .map(|entry| InTransit::new(&self.inner, entry.conn, "pool closing"))
                .collect()
        };
        self.inner.retire_all(connections).await;
        tracing::info!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PoolStatus {
        let max = self.inner.config.max_connections;
        PoolStatus {
            size: self.inner.size.load(Ordering::Acquire),
            idle: self.inner.idle.lock().len(),
            in_use: (max as usize).saturating_sub(self.inner.semaphore.available_permits()),
            max,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}
