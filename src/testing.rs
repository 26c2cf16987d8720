//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::driver::fault::{FaultConnector, FaultPlan};
use crate::driver::SqliteConnector;
use crate::engine::Engine;
use crate::events::{EventSink, Events, RecordingSink};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::retry::RetryPolicy;

/// An engine over a fault-injecting SQLite file database.
pub(crate) struct Fixture {
    pub engine: Engine,
    pub plan: Arc<FaultPlan>,
    pub sink: Arc<RecordingSink>,
    pub events: Events,
    pub dir: TempDir,
}

impl Fixture {
    pub async fn new(pool_config: PoolConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let connector = FaultConnector::new(SqliteConnector::new(path.to_str().unwrap()));
        let plan = connector.plan();
        let sink = Arc::new(RecordingSink::default());
        let events = Events::new(Some(sink.clone() as Arc<dyn EventSink>));

        let pool = ConnectionPool::connect(Arc::new(connector), pool_config, events.clone())
            .await
            .unwrap();
        let engine = Engine::new(pool, fast_policy(3), events.clone());

        Self {
            engine,
            plan,
            sink,
            events,
            dir,
        }
    }

    /// Run unprepared setup statements on one pooled connection.
    pub async fn batch(&self, sql: &str) {
        let mut conn = self.engine.pool().get().await.unwrap();
        conn.batch(sql).await.unwrap();
    }

    pub fn db_path(&self) -> String {
        self.dir.path().join("store.db").to_string_lossy().into_owned()
    }
}

/// Retry policy with millisecond backoff and no jitter.
pub(crate) fn fast_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .max_attempts(attempts)
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(Duration::ZERO)
}
