//! Prepared statement management and caching.
//!
//! This module provides:
//! - `PreparedStatement`: metadata for a statement compiled on one connection
//! - `StatementCache`: O(1) LRU cache for prepared statements per connection
//!
//! Statement handles are connection-scoped. Each pooled connection owns its
//! own `StatementCache`, so retiring a connection drops every statement it
//! prepared and a replacement connection re-prepares on first use.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::value::SharedColumns;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A statement that has been compiled by the datastore.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Connection-local name for this statement (e.g., "__sk_1")
    pub name: String,
    /// The SQL text
    pub sql: String,
    /// Number of bind parameters
    pub param_count: usize,
    /// Result column names, shared with every row produced
    pub columns: SharedColumns,
}

impl PreparedStatement {
    pub fn new(name: String, sql: String) -> Self {
        Self {
            name,
            sql,
            param_count: 0,
            columns: Arc::new(Vec::new()),
        }
    }

    pub fn with_param_count(mut self, count: usize) -> Self {
        self.param_count = count;
        self
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Arc::new(columns);
        self
    }

    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// O(1) LRU cache for prepared statements, one per connection.
///
/// Statements are stored as `Arc<PreparedStatement>` so a cache hit is a
/// reference count increment rather than a clone of the column list.
pub struct StatementCache {
    /// The LRU cache: SQL text → Arc<PreparedStatement>
    cache: LruCache<String, Arc<PreparedStatement>>,
    /// Counter for generating unique statement names
    next_id: u64,
}

impl StatementCache {
    /// Create a new statement cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            next_id: 0,
        }
    }

    /// Get a prepared statement and mark it recently used.
    pub fn get(&mut self, sql: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.get(sql).map(Arc::clone)
    }

    /// Check if a statement is cached without touching LRU order.
    #[inline]
    pub fn contains(&self, sql: &str) -> bool {
        self.cache.contains(sql)
    }

    /// Insert a prepared statement.
    ///
    /// If the cache is at capacity, the least recently used statement is
    /// evicted and its name returned so the driver can release it.
    pub fn insert(&mut self, statement: Arc<PreparedStatement>) -> Option<String> {
        match self.cache.push(statement.sql.clone(), statement) {
            // `push` also returns the old value when the key already existed
            Some((key, old)) if !self.cache.contains(&key) => Some(old.name.clone()),
            _ => None,
        }
    }

    /// Remove a statement from the cache.
    pub fn remove(&mut self, sql: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.pop(sql)
    }

    /// Generate a unique statement name for this connection.
    pub fn next_statement_name(&mut self) -> String {
        self.next_id += 1;
        format!("__sk_{}", self.next_id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(100)
    }
}
