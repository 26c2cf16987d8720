//! Fault-injecting driver wrapper for tests.
//!
//! Wraps a real connector and, following a shared `FaultPlan`, fails or
//! delays statements and pings before they reach the wrapped connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::{DriverError, DriverErrorKind, DriverResult};
use super::{Connector, DriverConnection};
use crate::statement::PreparedStatement;
use crate::value::{QueryResult, Value};

/// What to do with the next statement execution.
#[derive(Debug, Clone)]
pub(crate) enum Fault {
    /// Fail before preparing the statement
    FailPrepare(DriverErrorKind),
    /// Fail the execution itself
    Fail(DriverErrorKind),
    /// Sleep before running the statement
    Delay(Duration),
}

#[derive(Default)]
pub(crate) struct FaultPlan {
    faults: Mutex<VecDeque<Fault>>,
    failing_pings: AtomicUsize,
    ping_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    prepares: AtomicUsize,
    executions: AtomicUsize,
}

impl FaultPlan {
    pub(crate) fn push(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    pub(crate) fn push_n(&self, n: usize, fault: Fault) {
        let mut faults = self.faults.lock();
        for _ in 0..n {
            faults.push_back(fault.clone());
        }
    }

    pub(crate) fn fail_next_pings(&self, n: usize) {
        self.failing_pings.store(n, Ordering::SeqCst);
    }

    /// Make every ping sleep for `delay` first; `None` restores fast pings.
    pub(crate) fn delay_pings(&self, delay: Option<Duration>) {
        *self.ping_delay.lock() = delay;
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    /// Statement executions attempted (query + execute), faulted or not.
    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    fn next_fault(&self) -> Option<Fault> {
        self.faults.lock().pop_front()
    }

    fn take_ping_failure(&self) -> bool {
        self.failing_pings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub(crate) struct FaultConnector {
    inner: Arc<dyn Connector>,
    plan: Arc<FaultPlan>,
}

impl FaultConnector {
    pub(crate) fn new(inner: impl Connector) -> Self {
        Self {
            inner: Arc::new(inner),
            plan: Arc::new(FaultPlan::default()),
        }
    }

    pub(crate) fn plan(&self) -> Arc<FaultPlan> {
        Arc::clone(&self.plan)
    }
}

#[async_trait]
impl Connector for FaultConnector {
    async fn connect(&self) -> DriverResult<Box<dyn DriverConnection>> {
        self.plan.connects.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.connect().await?;
        Ok(Box::new(FaultConnection {
            inner,
            plan: Arc::clone(&self.plan),
        }))
    }

    fn describe(&self) -> String {
        format!("fault+{}", self.inner.describe())
    }
}

struct FaultConnection {
    inner: Box<dyn DriverConnection>,
    plan: Arc<FaultPlan>,
}

impl FaultConnection {
    async fn before_execute(&mut self) -> DriverResult<()> {
        self.plan.executions.fetch_add(1, Ordering::SeqCst);
        match self.plan.next_fault() {
            Some(Fault::Fail(kind)) | Some(Fault::FailPrepare(kind)) => {
                Err(DriverError::new(kind, "injected fault"))
            }
            Some(Fault::Delay(d)) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DriverConnection for FaultConnection {
    async fn prepare(&mut self, name: &str, sql: &str) -> DriverResult<PreparedStatement> {
        self.plan.prepares.fetch_add(1, Ordering::SeqCst);
        let front = self.plan.faults.lock().front().cloned();
        if let Some(Fault::FailPrepare(kind)) = front {
            self.plan.next_fault();
            return Err(DriverError::new(kind, "injected prepare fault"));
        }
        self.inner.prepare(name, sql).await
    }

    async fn query(&mut self, stmt: &PreparedStatement, params: &[Value]) -> DriverResult<QueryResult> {
        self.before_execute().await?;
        self.inner.query(stmt, params).await
    }

    async fn execute(&mut self, stmt: &PreparedStatement, params: &[Value]) -> DriverResult<u64> {
        self.before_execute().await?;
        self.inner.execute(stmt, params).await
    }

    async fn batch(&mut self, sql: &str) -> DriverResult<()> {
        self.inner.batch(sql).await
    }

    async fn ping(&mut self) -> DriverResult<()> {
        let delay = *self.plan.ping_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.plan.take_ping_failure() {
            return Err(DriverError::new(DriverErrorKind::ConnectionReset, "injected ping failure"));
        }
        self.inner.ping().await
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
