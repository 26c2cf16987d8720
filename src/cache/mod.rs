//! Result cache.
//!
//! Read results are cached under their normalized statement text and
//! parameters, each entry tagged with the tables it was read from. Entries
//! leave the cache when their TTL runs out, when capacity pressure evicts
//! them (least recently used first), or when one of their tables is
//! invalidated by a write.
//!
//! Architecture:
//! - `key`: key normalization and FROM/JOIN table extraction
//! - `stats`: lock-free counters and the public statistics snapshot
//!
//! The key space is split across independently locked LRU shards so that
//! concurrent readers of unrelated statements rarely contend.

pub mod key;
pub mod stats;

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::engine::Engine;
use crate::error::Result;
use crate::events::{EventKind, Events};
use crate::value::{SharedRows, Value};

pub use key::{extract_tables, normalize_sql, normalize_table, CacheKey};
pub use stats::CacheStatistics;
use stats::CacheCounters;

/// Entries per shard below which sharding is not worth it.
const MIN_ENTRIES_PER_SHARD: usize = 64;

/// Failures inside the cache itself. Never surfaced to callers: the read
/// falls back to an uncached fetch.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("parameter {index} cannot be used in a cache key: {reason}")]
    Unkeyable { index: usize, reason: String },

    #[error("failed to encode parameters: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of entries across all shards
    pub capacity: usize,
    /// TTL used when a read does not give one
    pub default_ttl: Duration,
    /// Upper bound on the number of shards
    pub shards: usize,
    /// Period of the background expiry sweep; zero disables it
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Duration::from_secs(60),
            shards: 16,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Shards actually used: enough to keep each one reasonably full, never
    /// more than configured.
    fn effective_shards(&self) -> usize {
        (self.capacity / MIN_ENTRIES_PER_SHARD).clamp(1, self.shards.max(1))
    }
}

struct CacheEntry {
    rows: SharedRows,
    created_at: Instant,
    ttl: Duration,
    tables: Vec<String>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }

    fn depends_on(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t == table)
    }
}

type Shard = Mutex<LruCache<CacheKey, CacheEntry>>;

/// Invalidation counts per table, plus an epoch bumped by `clear`.
///
/// A fill records the counts of its own tables before fetching and is only
/// stored if none of them moved, so writes to unrelated tables never keep a
/// read out of the cache.
#[derive(Default)]
struct Generations {
    epoch: AtomicU64,
    tables: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, PartialEq, Eq)]
struct FillTicket {
    epoch: u64,
    tables: Vec<u64>,
}

impl Generations {
    fn ticket(&self, tables: &[String]) -> FillTicket {
        let counts = self.tables.lock();
        FillTicket {
            epoch: self.epoch.load(Ordering::Acquire),
            tables: tables.iter().map(|t| counts.get(t).copied().unwrap_or(0)).collect(),
        }
    }

    fn bump(&self, table: &str) {
        *self.tables.lock().entry(table.to_string()).or_insert(0) += 1;
    }

    fn bump_all(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

struct CacheInner {
    engine: Engine,
    config: CacheConfig,
    shards: Vec<Shard>,
    hasher: RandomState,
    counters: CacheCounters,
    generations: Generations,
    events: Events,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CacheInner {
    fn shard_for(&self, key: &CacheKey) -> &Shard {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    fn lookup(&self, key: &CacheKey) -> Option<SharedRows> {
        let mut shard = self.shard_for(key).lock();
        let (rows, expired) = match shard.get(key) {
            Some(entry) if entry.is_expired() => (None, true),
            Some(entry) => (Some(Arc::clone(&entry.rows)), false),
            None => (None, false),
        };
        if expired {
            shard.pop(key);
        }
        drop(shard);

        if expired {
            self.counters.evicted(1);
            self.note_eviction(key, "expired");
        }
        match rows {
            Some(rows) => {
                self.counters.hit();
                Some(rows)
            }
            None => {
                self.counters.miss();
                None
            }
        }
    }

    fn store(&self, key: CacheKey, entry: CacheEntry, ticket: &FillTicket) {
        let mut shard = self.shard_for(&key).lock();
        if self.generations.ticket(&entry.tables) != *ticket {
            tracing::debug!(sql = key.sql(), "skipping store of result read across an invalidation");
            return;
        }
        let displaced = shard.push(key.clone(), entry);
        drop(shard);

        // `push` hands back the old value when the key was already present;
        // only a different key means something was evicted.
        if let Some((evicted, _)) = displaced {
            if evicted != key {
                self.counters.evicted(1);
                self.note_eviction(&evicted, "capacity");
            }
        }
    }

    fn note_eviction(&self, key: &CacheKey, reason: &str) {
        tracing::debug!(sql = key.sql(), reason, "cache entry evicted");
        self.events
            .emit(EventKind::CacheEviction, json!({ "sql": key.sql(), "reason": reason }));
    }

    fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let expired: Vec<CacheKey> = shard
                .iter()
                .filter(|(_, entry)| entry.is_expired())
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                shard.pop(key);
            }
            removed += expired.len();
        }
        if removed > 0 {
            self.counters.evicted(removed as u64);
            tracing::debug!(removed, "swept expired cache entries");
            self.events
                .emit(EventKind::CacheEviction, json!({ "reason": "expired", "removed": removed }));
        }
        removed
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

/// TTL and capacity bounded cache of read results.
///
/// Cheap to clone; clones share the same entries and counters.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<CacheInner>,
}

impl ResultCache {
    /// Create a cache that reads through `engine` on a miss.
    ///
    /// When called inside a tokio runtime and `sweep_interval` is non-zero,
    /// a background task removes expired entries periodically.
    pub fn new(engine: Engine, config: CacheConfig, events: Events) -> Self {
        let shard_count = config.effective_shards();
        let per_shard = config.capacity.max(1).div_ceil(shard_count);
        let per_shard = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);

        let shards = (0..shard_count).map(|_| Mutex::new(LruCache::new(per_shard))).collect();

        let cache = Self {
            inner: Arc::new(CacheInner {
                engine,
                config,
                shards,
                hasher: RandomState::new(),
                counters: CacheCounters::default(),
                generations: Generations::default(),
                events,
                sweeper: Mutex::new(None),
            }),
        };
        cache.spawn_sweeper();
        cache
    }

    fn spawn_sweeper(&self) {
        let interval = self.inner.config.sweep_interval;
        if interval.is_zero() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no runtime, expired entries are only removed on read");
            return;
        };

        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.sweep_expired();
            }
        });
        *self.inner.sweeper.lock() = Some(task);
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Read through the cache.
    ///
    /// Dependent tables are parsed from the statement's FROM and JOIN
    /// clauses. `ttl` defaults to the configured TTL; with `use_cache` false
    /// (or a zero TTL) the cache is bypassed entirely.
    pub async fn cached_fetch(
        &self,
        sql: &str,
        params: &[Value],
        ttl: Option<Duration>,
        use_cache: bool,
    ) -> Result<SharedRows> {
        self.fetch_through(sql, params, ttl, use_cache, None).await
    }

    /// Read through the cache with explicitly declared dependent tables.
    pub async fn cached_fetch_tagged(
        &self,
        sql: &str,
        params: &[Value],
        ttl: Option<Duration>,
        tables: &[&str],
    ) -> Result<SharedRows> {
        let tables = tables.iter().map(|t| normalize_table(t)).collect();
        self.fetch_through(sql, params, ttl, true, Some(tables)).await
    }

    async fn fetch_through(
        &self,
        sql: &str,
        params: &[Value],
        ttl: Option<Duration>,
        use_cache: bool,
        tables: Option<Vec<String>>,
    ) -> Result<SharedRows> {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        if !use_cache || ttl.is_zero() {
            self.inner.counters.bypass();
            return self.fetch_direct(sql, params).await;
        }

        let key = match CacheKey::new(sql, params) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(error = %e, "cache unavailable for read, fetching directly");
                self.inner
                    .events
                    .emit(EventKind::CacheFallback, json!({ "reason": e.to_string() }));
                self.inner.counters.bypass();
                return self.fetch_direct(sql, params).await;
            }
        };

        if let Some(rows) = self.inner.lookup(&key) {
            return Ok(rows);
        }

        let tables = tables.unwrap_or_else(|| extract_tables(sql));
        let ticket = self.inner.generations.ticket(&tables);
        let rows = self.fetch_direct(sql, params).await?;
        let entry = CacheEntry {
            rows: Arc::clone(&rows),
            created_at: Instant::now(),
            ttl,
            tables,
        };
        self.inner.store(key, entry, &ticket);
        Ok(rows)
    }

    async fn fetch_direct(&self, sql: &str, params: &[Value]) -> Result<SharedRows> {
        let engine = &self.inner.engine;
        let rows = engine.fetch(sql, params, engine.default_policy()).await?;
        Ok(Arc::new(rows))
    }

    /// Remove every entry that depends on `table`. Returns how many were
    /// removed.
    pub fn invalidate(&self, table: &str) -> usize {
        let table = normalize_table(table);
        self.inner.generations.bump(&table);

        let mut removed = 0;
        for shard in &self.inner.shards {
            let mut shard = shard.lock();
            let stale: Vec<CacheKey> = shard
                .iter()
                .filter(|(_, entry)| entry.depends_on(&table))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                shard.pop(key);
            }
            removed += stale.len();
        }

        self.inner.counters.invalidated(removed as u64);
        tracing::debug!(table = %table, removed, "cache invalidated");
        if removed > 0 {
            self.inner.events.emit(
                EventKind::CacheInvalidation,
                json!({ "table": table, "removed": removed }),
            );
        }
        removed
    }

    /// Invalidate several tables. Returns the total number of entries removed.
    pub fn invalidate_tables<I, S>(&self, tables: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tables.into_iter().map(|t| self.invalidate(t.as_ref())).sum()
    }

    /// Remove expired entries now. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired()
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        self.inner.generations.bump_all();
        for shard in &self.inner.shards {
            shard.lock().clear();
        }
        tracing::debug!("cache cleared");
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStatistics {
        self.inner.counters.snapshot(self.inner.len())
    }

    /// Stop the background sweeper.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.sweeper.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests;
