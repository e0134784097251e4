//! Statement-cache layer
//!
//! [`CachedDatabase`] wraps any [`Database`] and routes `execute`, `query` and
//! `query_row` through a [`StatementCache`]: textually equivalent queries share
//! one prepared statement, a statement that fails is evicted and closed, and a
//! query that cannot be prepared runs directly on the wrapped layer.
//!
//! Transactions and connections obtained from a cached database carry their
//! own cache, emptied when they finish.
//!
//! # Example
//!
//! ```ignore
//! let db = CachedDatabase::new(BaseDatabase::new(driver), StatementCacheConfig::default());
//!
//! // Prepared once, reused afterwards
//! for id in 0..10 {
//!     db.query_row("SELECT name FROM users WHERE id = ?", &[id.into()]).await?;
//! }
//! ```

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::{StatementCache, StatementCacheConfig};
use crate::contract::{Connection, Database, Queryer, Statement, Transaction};
use crate::driver::{Driver, DriverConnection, DriverTransaction, PoolStats, TxOptions};
use crate::error::Result;
use crate::value::{ExecResult, Row, Rows, Value};

/// Database layer that caches prepared statements
pub struct CachedDatabase<D> {
    inner: D,
    cache: StatementCache,
}

impl<D: Database> CachedDatabase<D> {
    /// Wrap a database with a statement cache
    pub fn new(inner: D, config: StatementCacheConfig) -> Self {
        Self {
            inner,
            cache: StatementCache::new(config),
        }
    }

    /// Wrap a database with the default cache configuration
    pub fn with_defaults(inner: D) -> Self {
        Self::new(inner, StatementCacheConfig::default())
    }

    /// The wrapped layer
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// The statement cache of this handle
    pub fn cache(&self) -> &StatementCache {
        &self.cache
    }
}

#[async_trait]
impl<D: Database> Queryer for CachedDatabase<D> {
    async fn prepare(&self, query: &str) -> Result<Box<dyn Statement>> {
        self.inner.prepare(query).await
    }

    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.cache.execute(&self.inner, query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.cache.query(&self.inner, query, args).await
    }

    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        self.cache.query_row(&self.inner, query, args).await
    }
}

#[async_trait]
impl<D: Database> Database for CachedDatabase<D> {
    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn close(&self) -> Result<()> {
        if let Err(err) = self.cache.close_all().await {
            warn!(error = %err, "failed to close cached statements");
        }
        self.inner.close().await
    }

    fn set_max_idle_conns(&self, n: usize) {
        self.inner.set_max_idle_conns(n)
    }

    fn set_max_open_conns(&self, n: usize) {
        self.inner.set_max_open_conns(n)
    }

    fn set_conn_max_lifetime(&self, d: Option<Duration>) {
        self.inner.set_conn_max_lifetime(d)
    }

    fn set_conn_max_idle_time(&self, d: Option<Duration>) {
        self.inner.set_conn_max_idle_time(d)
    }

    fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn Transaction>> {
        let tx = self.inner.begin(opts).await?;
        Ok(Box::new(CachedTransaction::new(tx, self.cache.config().clone())))
    }

    async fn conn(&self) -> Result<Box<dyn Connection>> {
        let conn = self.inner.conn().await?;
        Ok(Box::new(CachedConnection::new(conn, self.cache.config().clone())))
    }

    fn native(&self) -> &dyn Driver {
        self.inner.native()
    }
}

/// Transaction with its own statement cache
///
/// Cached statements are closed once the transaction is committed or rolled
/// back.
pub struct CachedTransaction {
    inner: Box<dyn Transaction>,
    cache: StatementCache,
}

impl CachedTransaction {
    /// Wrap a transaction with a fresh statement cache
    pub fn new(inner: Box<dyn Transaction>, config: StatementCacheConfig) -> Self {
        Self {
            inner,
            cache: StatementCache::new(config),
        }
    }

    /// The statement cache of this transaction
    pub fn cache(&self) -> &StatementCache {
        &self.cache
    }

    async fn finish(cache: StatementCache, outcome: &'static str) {
        if let Err(err) = cache.close_all().await {
            debug!(error = %err, outcome, "failed to close transaction statements");
        }
    }
}

#[async_trait]
impl Queryer for CachedTransaction {
    async fn prepare(&self, query: &str) -> Result<Box<dyn Statement>> {
        self.inner.prepare(query).await
    }

    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.cache.execute(self.inner.as_ref(), query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.cache.query(self.inner.as_ref(), query, args).await
    }

    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        self.cache.query_row(self.inner.as_ref(), query, args).await
    }
}

#[async_trait]
impl Transaction for CachedTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { inner, cache } = *self;
        let result = inner.commit().await;
        Self::finish(cache, "commit").await;
        result
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let Self { inner, cache } = *self;
        let result = inner.rollback().await;
        Self::finish(cache, "rollback").await;
        result
    }

    async fn adopt(&self, stmt: &dyn Statement) -> Result<Box<dyn Statement>> {
        self.inner.adopt(stmt).await
    }

    fn native(&self) -> &dyn DriverTransaction {
        self.inner.native()
    }
}

/// Connection with its own statement cache
pub struct CachedConnection {
    inner: Box<dyn Connection>,
    cache: StatementCache,
}

impl CachedConnection {
    /// Wrap a connection with a fresh statement cache
    pub fn new(inner: Box<dyn Connection>, config: StatementCacheConfig) -> Self {
        Self {
            inner,
            cache: StatementCache::new(config),
        }
    }

    /// The statement cache of this connection
    pub fn cache(&self) -> &StatementCache {
        &self.cache
    }
}

#[async_trait]
impl Queryer for CachedConnection {
    async fn prepare(&self, query: &str) -> Result<Box<dyn Statement>> {
        self.inner.prepare(query).await
    }

    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.cache.execute(self.inner.as_ref(), query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.cache.query(self.inner.as_ref(), query, args).await
    }

    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        self.cache.query_row(self.inner.as_ref(), query, args).await
    }
}

#[async_trait]
impl Connection for CachedConnection {
    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn with_native(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a dyn Any) -> Result<()> + Send),
    ) -> Result<()> {
        self.inner.with_native(f).await
    }

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn Transaction>> {
        let tx = self.inner.begin(opts).await?;
        Ok(Box::new(CachedTransaction::new(tx, self.cache.config().clone())))
    }

    async fn close(&self) -> Result<()> {
        if let Err(err) = self.cache.close_all().await {
            warn!(error = %err, "failed to close connection statements");
        }
        self.inner.close().await
    }

    fn native(&self) -> &dyn DriverConnection {
        self.inner.native()
    }
}
