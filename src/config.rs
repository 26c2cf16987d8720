//! Store configuration.
//!
//! Loaded once at startup from TOML; every section and field is optional.
//! Durations are integer milliseconds.
//!
//! ```toml
//! url = "sqlite:/var/lib/bot/store.db"
//!
//! [pool]
//! min_connections = 2
//! max_connections = 16
//!
//! [retry]
//! max_attempts = 4
//! base_delay_ms = 50
//!
//! [cache]
//! capacity = 5000
//! default_ttl_ms = 30000
//!
//! [[views]]
//! name = "leaderboard"
//! interval_ms = 300000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::error::{Result, StoreError};
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;
use crate::scheduler::{ViewRefresh, DEFAULT_REFRESH_TEMPLATE};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoreConfig {
    /// Datastore URL; credentials, if any, are part of it
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub cache: CacheSettings,
    /// Statement used to refresh a view; `{view}` is replaced by its name
    #[serde(default = "default_refresh_template")]
    pub refresh_template: String,
    #[serde(default)]
    pub views: Vec<ViewSettings>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    #[serde(default = "default_statement_cache_capacity")]
    pub statement_cache_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default)]
    pub retry_writes: bool,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    #[serde(default = "default_shards")]
    pub shards: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ViewSettings {
    pub name: String,
    pub interval_ms: u64,
    /// Overrides the refresh template for this view
    #[serde(default)]
    pub sql: Option<String>,
}

fn default_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_refresh_template() -> String {
    DEFAULT_REFRESH_TEMPLATE.to_string()
}

fn default_min_connections() -> u32 {
    1
}
fn default_max_connections() -> u32 {
    10
}
fn default_idle_timeout_ms() -> u64 {
    600_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_acquire_timeout_ms() -> u64 {
    30_000
}
fn default_reap_interval_ms() -> u64 {
    30_000
}
fn default_statement_cache_capacity() -> usize {
    100
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_jitter_ms() -> u64 {
    100
}

fn default_cache_capacity() -> usize {
    1_000
}
fn default_ttl_ms() -> u64 {
    60_000
}
fn default_shards() -> usize {
    16
}
fn default_sweep_interval_ms() -> u64 {
    30_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            pool: PoolSettings::default(),
            retry: RetrySettings::default(),
            cache: CacheSettings::default(),
            refresh_template: default_refresh_template(),
            views: Vec::new(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            reap_interval_ms: default_reap_interval_ms(),
            statement_cache_capacity: default_statement_cache_capacity(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            retry_writes: false,
            deadline_ms: None,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            default_ttl_ms: default_ttl_ms(),
            shards: default_shards(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    pub fn refresh_template(mut self, template: impl Into<String>) -> Self {
        self.refresh_template = template.into();
        self
    }

    pub fn view(mut self, name: impl Into<String>, interval: Duration) -> Self {
        self.views.push(ViewSettings {
            name: name.into(),
            interval_ms: interval.as_millis() as u64,
            sql: None,
        });
        self
    }

    /// Check bounds that would otherwise fail later, at pool or cache
    /// construction.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(StoreError::Config("url must not be empty".into()));
        }
        let pool = &self.pool;
        if pool.max_connections == 0 {
            return Err(StoreError::Config("pool.max_connections must be at least 1".into()));
        }
        if pool.min_connections > pool.max_connections {
            return Err(StoreError::Config(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                pool.min_connections, pool.max_connections
            )));
        }
        if pool.reap_interval_ms == 0 {
            return Err(StoreError::Config("pool.reap_interval_ms must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(StoreError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(StoreError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.cache.capacity == 0 {
            return Err(StoreError::Config("cache.capacity must be at least 1".into()));
        }
        if !self.refresh_template.contains("{view}") {
            return Err(StoreError::Config("refresh_template must contain {view}".into()));
        }
        for view in &self.views {
            if view.interval_ms == 0 {
                return Err(StoreError::Config(format!(
                    "views.{}: interval_ms must be positive",
                    view.name
                )));
            }
        }
        Ok(())
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(s: &PoolSettings) -> Self {
        PoolConfig::new()
            .min_connections(s.min_connections)
            .max_connections(s.max_connections)
            .idle_timeout(Duration::from_millis(s.idle_timeout_ms))
            .connect_timeout(Duration::from_millis(s.connect_timeout_ms))
            .acquire_timeout(Duration::from_millis(s.acquire_timeout_ms))
            .reap_interval(Duration::from_millis(s.reap_interval_ms))
            .statement_cache_capacity(s.statement_cache_capacity)
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        let policy = RetryPolicy::default()
            .max_attempts(s.max_attempts)
            .base_delay(Duration::from_millis(s.base_delay_ms))
            .max_delay(Duration::from_millis(s.max_delay_ms))
            .jitter(Duration::from_millis(s.jitter_ms))
            .retry_writes(s.retry_writes);
        match s.deadline_ms {
            Some(ms) => policy.deadline(Duration::from_millis(ms)),
            None => policy,
        }
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(s: &CacheSettings) -> Self {
        CacheConfig::new()
            .capacity(s.capacity)
            .default_ttl(Duration::from_millis(s.default_ttl_ms))
            .shards(s.shards)
            .sweep_interval(Duration::from_millis(s.sweep_interval_ms))
    }
}

impl From<&ViewSettings> for ViewRefresh {
    fn from(s: &ViewSettings) -> Self {
        let refresh = ViewRefresh::new(s.name.clone(), Duration::from_millis(s.interval_ms));
        match &s.sql {
            Some(sql) => refresh.sql(sql.clone()),
            None => refresh,
        }
    }
}
