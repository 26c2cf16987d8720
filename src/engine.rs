//! Resilient statement execution.
//!
//! Every attempt borrows a connection from the pool, reuses or prepares the
//! statement on it and runs it; the connection goes back to the pool when the
//! attempt ends, however it ends. Failures are classified and only transient
//! ones are retried, with exponential backoff, up to the policy's attempt
//! budget and deadline.
//!
//! Writes are not blindly retried: a transient failure that happened after
//! the statement was sent may already have been applied, so it is retried
//! only when the policy sets `retry_writes`. Failures before the statement
//! reached the datastore (acquiring a connection, preparing) are always safe
//! to retry.

use serde_json::json;
use tokio::time::Instant;

use crate::error::{Result, StoreError};
use crate::events::{EventKind, Events};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::retry::RetryPolicy;
use crate::value::{Row, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Query,
    Execute,
}

impl Op {
    fn is_read(self) -> bool {
        self == Op::Query
    }
}

enum Outcome {
    Rows(Vec<Row>),
    Affected(u64),
}

/// Where an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Before the statement was sent for execution
    BeforeSend,
    /// While (or after) the statement was executing
    Execute,
}

struct AttemptError {
    stage: Stage,
    error: StoreError,
}

impl AttemptError {
    fn before_send(error: StoreError) -> Self {
        Self {
            stage: Stage::BeforeSend,
            error,
        }
    }

    fn during_execute(error: StoreError) -> Self {
        Self {
            stage: Stage::Execute,
            error,
        }
    }
}

/// Executes statements through the pool with classified retries.
#[derive(Clone)]
pub struct Engine {
    pool: ConnectionPool,
    default_policy: RetryPolicy,
    events: Events,
}

impl Engine {
    pub fn new(pool: ConnectionPool, default_policy: RetryPolicy, events: Events) -> Self {
        Self {
            pool,
            default_policy,
            events,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Run a statement and return the number of rows affected.
    pub async fn execute(&self, sql: &str, params: &[Value], policy: &RetryPolicy) -> Result<u64> {
        match self.run(sql, params, Op::Execute, policy).await? {
            Outcome::Affected(n) => Ok(n),
            Outcome::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    /// Run a statement and return all of its rows, in order.
    pub async fn fetch(&self, sql: &str, params: &[Value], policy: &RetryPolicy) -> Result<Vec<Row>> {
        match self.run(sql, params, Op::Query, policy).await? {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Affected(_) => Ok(Vec::new()),
        }
    }

    /// First row of the result, if any.
    pub async fn fetch_one(&self, sql: &str, params: &[Value], policy: &RetryPolicy) -> Result<Option<Row>> {
        Ok(self.fetch(sql, params, policy).await?.into_iter().next())
    }

    /// First column of the first row, if any.
    pub async fn fetch_scalar(&self, sql: &str, params: &[Value], policy: &RetryPolicy) -> Result<Option<Value>> {
        Ok(self.fetch_one(sql, params, policy).await?.and_then(Row::into_first))
    }

    /// Single attempt on an already borrowed connection. Used inside
    /// transactions, where retrying a statement is never safe.
    pub async fn execute_on(&self, conn: &mut PooledConnection, sql: &str, params: &[Value]) -> Result<u64> {
        conn.execute(sql, params).await.map_err(StoreError::from_driver)
    }

    /// Single-attempt fetch on an already borrowed connection.
    pub async fn fetch_on(&self, conn: &mut PooledConnection, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        conn.query(sql, params)
            .await
            .map(|result| result.rows)
            .map_err(StoreError::from_driver)
    }

    async fn run(&self, sql: &str, params: &[Value], op: Op, policy: &RetryPolicy) -> Result<Outcome> {
        let deadline = policy.deadline.map(|d| (Instant::now() + d, d));
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let acquire_timeout = match deadline {
                Some((at, _)) => at
                    .saturating_duration_since(Instant::now())
                    .min(self.pool.config().acquire_timeout),
                None => self.pool.config().acquire_timeout,
            };

            let result = match deadline {
                Some((at, limit)) => {
                    match tokio::time::timeout_at(at, self.attempt(sql, params, op, acquire_timeout)).await {
                        Ok(result) => result,
                        Err(_) => {
                            tracing::warn!(attempt, ?limit, "statement abandoned at deadline");
                            return Err(StoreError::Timeout(limit));
                        }
                    }
                }
                None => self.attempt(sql, params, op, acquire_timeout).await,
            };

            let failure = match result {
                Ok(outcome) => return Ok(outcome),
                Err(failure) => failure,
            };

            let kind = failure.error.kind();
            let retryable = failure.error.is_transient()
                && (failure.stage == Stage::BeforeSend || op.is_read() || policy.retry_writes);

            if !retryable {
                tracing::debug!(attempt, kind, transient = failure.error.is_transient(), "statement failed");
                return Err(failure.error);
            }

            if attempt >= max_attempts {
                tracing::error!(attempts = attempt, kind, error = %failure.error, "retries exhausted");
                self.events.emit(
                    EventKind::RetryExhausted,
                    json!({ "attempts": attempt, "kind": kind }),
                );
                return Err(StoreError::RetryExhausted {
                    attempts: attempt,
                    last: Box::new(failure.error),
                });
            }

            let delay = policy.delay_for(attempt - 1);
            if let Some((at, limit)) = deadline {
                if Instant::now() + delay >= at {
                    tracing::warn!(attempt, kind, ?limit, "deadline leaves no room for another attempt");
                    return Err(StoreError::Timeout(limit));
                }
            }

            tracing::warn!(
                attempt,
                max_attempts,
                kind,
                delay_ms = delay.as_millis() as u64,
                error = %failure.error,
                "transient failure, retrying"
            );
            self.events.emit(
                EventKind::RetryAttempt,
                json!({
                    "attempt": attempt,
                    "max_attempts": max_attempts,
                    "kind": kind,
                    "delay_ms": delay.as_millis() as u64,
                }),
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One attempt. The connection is released when this future completes
    /// or is dropped.
    async fn attempt(
        &self,
        sql: &str,
        params: &[Value],
        op: Op,
        acquire_timeout: std::time::Duration,
    ) -> std::result::Result<Outcome, AttemptError> {
        let mut conn = self
            .pool
            .acquire(acquire_timeout)
            .await
            .map_err(AttemptError::before_send)?;

        let stmt = conn
            .prepared(sql)
            .await
            .map_err(|e| AttemptError::before_send(StoreError::from_driver(e)))?;

        let outcome = match op {
            Op::Query => conn.query_prepared(&stmt, params).await.map(|r| Outcome::Rows(r.rows)),
            Op::Execute => conn.execute_prepared(&stmt, params).await.map(Outcome::Affected),
        };
        outcome.map_err(|e| AttemptError::during_execute(StoreError::from_driver(e)))
    }
}
