//! The `Database` handle: one pool, engine, result cache, transaction
//! coordinator and refresh scheduler behind a single cloneable value.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheConfig, CacheStatistics, ResultCache};
use crate::config::StoreConfig;
use crate::driver::{Connector, SqliteConnector};
use crate::engine::Engine;
use crate::error::{Result, StoreError};
use crate::events::{EventSink, Events};
use crate::pool::{ConnectionPool, PoolConfig, PoolStatus};
use crate::retry::RetryPolicy;
use crate::scheduler::{RefreshScheduler, RefreshStatus, ViewRefresh};
use crate::transaction::{TransactionCoordinator, TxStatement};
use crate::value::{Row, SharedRows, Value};

/// Entry point for request handlers.
///
/// Construct one at startup and pass clones to whoever needs it; call
/// [`Database::shutdown`] before exiting.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    config: StoreConfig,
    engine: Engine,
    cache: ResultCache,
    coordinator: TransactionCoordinator,
    scheduler: RefreshScheduler,
}

impl Database {
    /// Open a database for a `sqlite:` URL.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let connector = SqliteConnector::from_url(&config.url)
            .ok_or_else(|| StoreError::Config(format!("unsupported datastore url scheme: {}", scheme(&config.url))))?
            .statement_cache_capacity(config.pool.statement_cache_capacity);
        Self::with_connector(config, Arc::new(connector), None).await
    }

    /// Open a database over any driver, optionally forwarding events to `sink`.
    pub async fn with_connector(
        config: StoreConfig,
        connector: Arc<dyn Connector>,
        sink: Option<Arc<dyn EventSink>>,
    ) -> Result<Self> {
        config.validate()?;
        let events = Events::new(sink);

        let pool = ConnectionPool::connect(connector, PoolConfig::from(&config.pool), events.clone()).await?;
        let default_policy = RetryPolicy::from(&config.retry);
        let engine = Engine::new(pool, default_policy.clone(), events.clone());
        let cache = ResultCache::new(engine.clone(), CacheConfig::from(&config.cache), events.clone());
        let coordinator = TransactionCoordinator::new(engine.clone(), Some(cache.clone()), events.clone());
        let scheduler = RefreshScheduler::new(
            engine.clone(),
            Some(cache.clone()),
            config.refresh_template.clone(),
            default_policy,
            events,
        );

        for view in &config.views {
            scheduler.schedule_with(ViewRefresh::from(view))?;
        }

        tracing::info!(
            views = config.views.len(),
            cache_capacity = config.cache.capacity,
            "database ready"
        );

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                config,
                engine,
                cache,
                coordinator,
                scheduler,
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.inner.scheduler
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        self.inner.engine.default_policy()
    }

    // ------------------------------------------------------------------------
    // Single statements
    // ------------------------------------------------------------------------

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.inner.engine.execute(sql, params, self.default_policy()).await
    }

    pub async fn execute_with(&self, sql: &str, params: &[Value], policy: &RetryPolicy) -> Result<u64> {
        self.inner.engine.execute(sql, params, policy).await
    }

    pub async fn fetch(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.inner.engine.fetch(sql, params, self.default_policy()).await
    }

    pub async fn fetch_with(&self, sql: &str, params: &[Value], policy: &RetryPolicy) -> Result<Vec<Row>> {
        self.inner.engine.fetch(sql, params, policy).await
    }

    pub async fn fetch_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        self.inner.engine.fetch_one(sql, params, self.default_policy()).await
    }

    pub async fn fetch_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        self.inner.engine.fetch_scalar(sql, params, self.default_policy()).await
    }

    /// Execute a write and invalidate cached reads of `tables` before
    /// returning. Invalidation happens even when the write fails, since a
    /// failed write may still have been applied.
    pub async fn write(&self, sql: &str, params: &[Value], tables: &[&str]) -> Result<u64> {
        let result = self.execute(sql, params).await;
        self.inner.cache.invalidate_tables(tables);
        result
    }

    pub async fn run_in_transaction(&self, statements: Vec<TxStatement>) -> Result<Vec<u64>> {
        self.inner.coordinator.run_in_transaction(statements).await
    }

    // ------------------------------------------------------------------------
    // Cache
    // ------------------------------------------------------------------------

    pub async fn cached_fetch(
        &self,
        sql: &str,
        params: &[Value],
        ttl: Option<Duration>,
        use_cache: bool,
    ) -> Result<SharedRows> {
        self.inner.cache.cached_fetch(sql, params, ttl, use_cache).await
    }

    pub async fn cached_fetch_tagged(
        &self,
        sql: &str,
        params: &[Value],
        ttl: Option<Duration>,
        tables: &[&str],
    ) -> Result<SharedRows> {
        self.inner.cache.cached_fetch_tagged(sql, params, ttl, tables).await
    }

    pub fn invalidate(&self, table: &str) -> usize {
        self.inner.cache.invalidate(table)
    }

    pub fn get_cache_stats(&self) -> CacheStatistics {
        self.inner.cache.stats()
    }

    // ------------------------------------------------------------------------
    // Refresh scheduling
    // ------------------------------------------------------------------------

    pub fn schedule_refresh(&self, view: &str, interval: Duration) -> Result<()> {
        self.inner.scheduler.schedule(view, interval)
    }

    pub fn schedule_refresh_with(&self, refresh: ViewRefresh) -> Result<()> {
        self.inner.scheduler.schedule_with(refresh)
    }

    pub fn refresh_status(&self, view: &str) -> Option<RefreshStatus> {
        self.inner.scheduler.status(view)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn pool_status(&self) -> PoolStatus {
        self.inner.engine.pool().status()
    }

    /// Stop background tasks and close every connection. Calls made after
    /// this fail with `PoolClosed`.
    pub async fn shutdown(&self) {
        self.inner.scheduler.shutdown().await;
        self.inner.cache.shutdown();
        self.inner.engine.pool().close().await;
        tracing::info!("database shut down");
    }
}

fn scheme(url: &str) -> &str {
    url.split_once(':').map(|(scheme, _)| scheme).unwrap_or(url)
}
