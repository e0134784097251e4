//! Shared prepared-statement cache
//!
//! This module provides the cache behind [`crate::cached`]: textually equivalent
//! queries are folded onto one normalized key, and each key maps to a single
//! prepared statement shared by every caller.
//!
//! # Guarantees
//!
//! - A key is prepared at most once while its statement is live. Concurrent
//!   misses on the same key are collapsed by re-checking under the write lock
//!   before preparing, and the statement is inserted before that lock is
//!   released.
//! - A statement that fails is removed from the map before it is closed.
//! - A failed prepare stores nothing; the caller falls back to the uncached
//!   path of the wrapped layer.
//!
//! # Example
//!
//! ```
//! use sql_layers::cache::{normalize, StatementCacheConfig};
//!
//! assert_eq!(normalize("  SELECT 1 "), "SELECT 1;");
//!
//! let config = StatementCacheConfig::builder()
//!     .max_entries(100)
//!     .enabled(true)
//!     .build();
//! assert_eq!(config.max_entries(), Some(100));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::contract::{Queryer, Statement};
use crate::error::{Error, Result};
use crate::value::{ExecResult, Row, Rows, Value};

/// Character that terminates a statement in a normalized key
pub const STATEMENT_DELIMITER: char = ';';

/// Normalize query text into a cache key
///
/// Surrounding whitespace is trimmed and a single [`STATEMENT_DELIMITER`] is
/// appended when the text does not already end with one. Normalizing twice
/// gives the same key.
pub fn normalize(query: &str) -> String {
    let trimmed = query.trim();
    let mut key = String::with_capacity(trimmed.len() + 1);
    key.push_str(trimmed);
    if !key.ends_with(STATEMENT_DELIMITER) {
        key.push(STATEMENT_DELIMITER);
    }
    key
}

/// Configuration for the statement cache
///
/// # Example
///
/// ```
/// use sql_layers::cache::StatementCacheConfig;
///
/// let config = StatementCacheConfig::builder()
///     .max_entries(200)
///     .build();
/// assert!(config.enabled());
/// ```
#[derive(Debug, Clone)]
pub struct StatementCacheConfig {
    /// Maximum number of cache entries (`None` means unbounded)
    max_entries: Option<usize>,
    /// Whether caching is enabled
    enabled: bool,
}

impl Default for StatementCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: None,
            enabled: true,
        }
    }
}

impl StatementCacheConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a disabled cache configuration
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Create a builder for configuring the cache
    pub fn builder() -> StatementCacheConfigBuilder {
        StatementCacheConfigBuilder::default()
    }

    /// Get the maximum number of entries (if bounded)
    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    /// Check if caching is enabled
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

/// Builder for StatementCacheConfig
#[derive(Debug, Default)]
pub struct StatementCacheConfigBuilder {
    max_entries: Option<Option<usize>>,
    enabled: Option<bool>,
}

impl StatementCacheConfigBuilder {
    /// Set the maximum number of cache entries
    ///
    /// Once the cache is full, queries that miss are run uncached.
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(Some(max));
        self
    }

    /// Remove the entry limit
    pub fn unbounded(mut self) -> Self {
        self.max_entries = Some(None);
        self
    }

    /// Enable or disable caching
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Build the configuration
    pub fn build(self) -> StatementCacheConfig {
        let default = StatementCacheConfig::default();
        StatementCacheConfig {
            max_entries: self.max_entries.unwrap_or(default.max_entries),
            enabled: self.enabled.unwrap_or(default.enabled),
        }
    }
}

/// Map from normalized query to its shared prepared statement
///
/// The map is created with the cache and guarded by a single async
/// reader/writer lock. Lock guards are released when a future is dropped, so
/// cancelling a caller mid-resolution never leaves the lock held.
pub struct StatementCache {
    config: StatementCacheConfig,
    entries: RwLock<HashMap<String, Arc<dyn Statement>>>,
    stats: CacheStats,
}

impl StatementCache {
    /// Create a new statement cache with the given configuration
    pub fn new(config: StatementCacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    /// Create a cache with default configuration
    pub fn with_defaults() -> Self {
        Self::new(StatementCacheConfig::default())
    }

    /// Get the cache configuration
    pub fn config(&self) -> &StatementCacheConfig {
        &self.config
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            insertions: self.stats.insertions.load(Ordering::Relaxed),
            prepare_failures: self.stats.prepare_failures.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            fallbacks: self.stats.fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Get the current number of cached statements
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Check if the cache is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Check if a query has a cached statement; the query is normalized first
    pub async fn contains(&self, query: &str) -> bool {
        self.entries.read().await.contains_key(&normalize(query))
    }

    /// Find or prepare the statement for a normalized key
    ///
    /// The lookup first runs under the read lock. On a miss the write lock is
    /// taken and the key checked again, so a statement prepared by a racing
    /// caller is reused instead of prepared twice. The prepare itself runs
    /// under the write lock and its result is stored only if it succeeded.
    pub async fn resolve<Q>(&self, inner: &Q, key: &str) -> Result<Arc<dyn Statement>>
    where
        Q: Queryer + ?Sized,
    {
        if let Some(stmt) = self.entries.read().await.get(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(stmt));
        }

        let mut entries = self.entries.write().await;
        if let Some(stmt) = entries.get(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(stmt));
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        if let Some(capacity) = self.config.max_entries {
            if entries.len() >= capacity {
                return Err(Error::CacheFull { capacity });
            }
        }

        let stmt: Arc<dyn Statement> = match inner.prepare(key).await {
            Ok(stmt) => Arc::from(stmt),
            Err(err) => {
                self.stats.prepare_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        debug!(query = %key, "prepared statement cached");
        entries.insert(key.to_string(), Arc::clone(&stmt));
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        Ok(stmt)
    }

    /// Remove a failed statement and close it
    ///
    /// The entry is removed only if it still holds `failed`; a statement
    /// prepared since then under the same key is left alone. Close errors are
    /// discarded. Returns true if this call removed the entry.
    pub async fn evict(&self, key: &str, failed: &Arc<dyn Statement>, cause: &Error) -> bool {
        let removed = {
            let mut entries = self.entries.write().await;
            match entries.get(key) {
                Some(current) if Arc::ptr_eq(current, failed) => entries.remove(key),
                _ => None,
            }
        };

        let Some(stmt) = removed else {
            return false;
        };
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        warn!(query = %key, error = %cause, "evicting cached statement after failure");
        if let Err(err) = stmt.close().await {
            debug!(query = %key, error = %err, "closing evicted statement failed");
        }
        true
    }

    /// Drain the cache and close every statement it held
    ///
    /// All statements are closed even if some fail; the first failure is
    /// returned.
    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<(String, Arc<dyn Statement>)> =
            self.entries.write().await.drain().collect();
        if drained.is_empty() {
            return Ok(());
        }

        let results = join_all(drained.iter().map(|(_, stmt)| stmt.close())).await;
        let mut first_error = None;
        for ((key, _), result) in drained.iter().zip(results) {
            if let Err(err) = result {
                debug!(query = %key, error = %err, "closing cached statement failed");
                first_error.get_or_insert(err);
            }
        }
        debug!(count = drained.len(), "closed cached statements");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Execute through the cache, falling back to `inner` when no statement
    /// can be resolved
    pub async fn execute<Q>(&self, inner: &Q, query: &str, args: &[Value]) -> Result<ExecResult>
    where
        Q: Queryer + ?Sized,
    {
        if !self.config.enabled {
            return inner.execute(query, args).await;
        }

        let key = normalize(query);
        let stmt = match self.resolve(inner, &key).await {
            Ok(stmt) => stmt,
            Err(err) => {
                self.record_fallback(&key, &err);
                return inner.execute(query, args).await;
            }
        };

        let result = stmt.execute(args).await;
        if let Err(err) = &result {
            self.evict(&key, &stmt, err).await;
        }
        result
    }

    /// Query through the cache, falling back to `inner` when no statement can
    /// be resolved
    pub async fn query<Q>(&self, inner: &Q, query: &str, args: &[Value]) -> Result<Rows>
    where
        Q: Queryer + ?Sized,
    {
        if !self.config.enabled {
            return inner.query(query, args).await;
        }

        let key = normalize(query);
        let stmt = match self.resolve(inner, &key).await {
            Ok(stmt) => stmt,
            Err(err) => {
                self.record_fallback(&key, &err);
                return inner.query(query, args).await;
            }
        };

        let result = stmt.query(args).await;
        if let Err(err) = &result {
            self.evict(&key, &stmt, err).await;
        }
        result
    }

    /// Single-row query through the cache; `Ok(None)` does not evict
    pub async fn query_row<Q>(&self, inner: &Q, query: &str, args: &[Value]) -> Result<Option<Row>>
    where
        Q: Queryer + ?Sized,
    {
        if !self.config.enabled {
            return inner.query_row(query, args).await;
        }

        let key = normalize(query);
        let stmt = match self.resolve(inner, &key).await {
            Ok(stmt) => stmt,
            Err(err) => {
                self.record_fallback(&key, &err);
                return inner.query_row(query, args).await;
            }
        };

        let result = stmt.query_row(args).await;
        if let Err(err) = &result {
            self.evict(&key, &stmt, err).await;
        }
        result
    }

    fn record_fallback(&self, key: &str, err: &Error) {
        self.stats.fallbacks.fetch_add(1, Ordering::Relaxed);
        debug!(query = %key, error = %err, "statement cache bypassed");
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Internal statistics tracking
#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    prepare_failures: AtomicU64,
    evictions: AtomicU64,
    fallbacks: AtomicU64,
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Lookups answered by a cached statement
    pub hits: u64,
    /// Lookups that had to prepare
    pub misses: u64,
    /// Statements prepared and stored
    pub insertions: u64,
    /// Prepares that failed
    pub prepare_failures: u64,
    /// Statements removed after a failure
    pub evictions: u64,
    /// Calls that ran uncached because no statement could be resolved
    pub fallbacks: u64,
}

impl CacheStatsSnapshot {
    /// Get the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
