//! Atomic multi-statement batches.
//!
//! A batch runs on one pooled connection between BEGIN and COMMIT. Any
//! failure rolls the whole batch back and reports which statement failed.
//! Statements inside a transaction are never retried individually: a retry
//! could apply the earlier statements twice.

use std::fmt;

use serde_json::json;
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::engine::Engine;
use crate::error::{Result, StoreError};
use crate::events::{EventKind, Events};
use crate::pool::PooledConnection;
use crate::value::Value;

tokio::task_local! {
    /// Id of the transaction running on the current task, if any.
    static CURRENT_TRANSACTION: Uuid;
}

/// One statement of a transactional batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TxStatement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Tables this statement writes; invalidated in the result cache after
    /// the batch commits.
    pub tables: Vec<String>,
}

impl TxStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            tables: Vec::new(),
        }
    }

    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn writes(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }
}

/// Transaction lifecycle. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    Began,
    Executing(usize),
    Committed,
    RolledBack,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxState::Idle => f.write_str("idle"),
            TxState::Began => f.write_str("began"),
            TxState::Executing(i) => write!(f, "executing({i})"),
            TxState::Committed => f.write_str("committed"),
            TxState::RolledBack => f.write_str("rolled_back"),
        }
    }
}

struct Tracker {
    id: Uuid,
    state: TxState,
}

impl Tracker {
    fn enter(&mut self, next: TxState) {
        tracing::debug!(tx = %self.id, from = %self.state, to = %next, "transaction state");
        self.state = next;
    }
}

/// Runs statement batches atomically.
#[derive(Clone)]
pub struct TransactionCoordinator {
    engine: Engine,
    cache: Option<ResultCache>,
    events: Events,
}

impl TransactionCoordinator {
    pub fn new(engine: Engine, cache: Option<ResultCache>, events: Events) -> Self {
        Self { engine, cache, events }
    }

    /// Whether the current task is inside `run_in_transaction`.
    pub fn in_transaction() -> bool {
        CURRENT_TRANSACTION.try_with(|_| ()).is_ok()
    }

    /// Execute `statements` in order as one transaction, returning the rows
    /// affected by each.
    ///
    /// On failure everything is rolled back and `TransactionAborted` carries
    /// the index of the failing statement (`statements.len()` when COMMIT
    /// itself failed). Calling this again from inside a running transaction
    /// on the same task fails with `NestedTransaction`.
    pub async fn run_in_transaction(&self, statements: Vec<TxStatement>) -> Result<Vec<u64>> {
        if Self::in_transaction() {
            return Err(StoreError::NestedTransaction);
        }
        if statements.is_empty() {
            return Ok(Vec::new());
        }

        let id = Uuid::new_v4();
        let results = CURRENT_TRANSACTION.scope(id, self.run_batch(id, &statements)).await?;

        if let Some(cache) = &self.cache {
            for stmt in &statements {
                cache.invalidate_tables(&stmt.tables);
            }
        }
        Ok(results)
    }

    async fn run_batch(&self, id: Uuid, statements: &[TxStatement]) -> Result<Vec<u64>> {
        let mut tx = Tracker {
            id,
            state: TxState::Idle,
        };
        let mut conn = self.engine.pool().get().await?;

        conn.begin().await.map_err(StoreError::from_driver)?;
        tx.enter(TxState::Began);

        let mut results = Vec::with_capacity(statements.len());
        for (index, stmt) in statements.iter().enumerate() {
            tx.enter(TxState::Executing(index));
            match self.engine.execute_on(&mut conn, &stmt.sql, &stmt.params).await {
                Ok(affected) => results.push(affected),
                Err(e) => return Err(self.abort(&mut conn, &mut tx, index, e).await),
            }
        }

        if let Err(e) = conn.commit().await {
            let e = StoreError::from_driver(e);
            return Err(self.abort(&mut conn, &mut tx, statements.len(), e).await);
        }
        tx.enter(TxState::Committed);
        Ok(results)
    }

    async fn abort(&self, conn: &mut PooledConnection, tx: &mut Tracker, index: usize, cause: StoreError) -> StoreError {
        if let Err(e) = conn.rollback().await {
            tracing::warn!(tx = %tx.id, error = %e, "rollback failed, discarding connection");
            conn.discard();
        }
        tx.enter(TxState::RolledBack);

        tracing::warn!(tx = %tx.id, index, kind = cause.kind(), error = %cause, "transaction rolled back");
        self.events.emit(
            EventKind::TransactionRolledBack,
            json!({ "tx": tx.id.to_string(), "index": index, "kind": cause.kind() }),
        );
        StoreError::TransactionAborted {
            index,
            source: Box::new(cause),
        }
    }
}
