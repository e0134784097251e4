//! The capability contract every layer implements
//!
//! A stack is built from layers that all implement the same four traits:
//! [`Database`], [`Statement`], [`Transaction`] and [`Connection`]. Each layer
//! owns the layer below it and forwards to it, so any layer can be placed
//! anywhere in the stack:
//!
//! ```ignore
//! let db = BaseDatabase::new(driver);
//! let db = CachedDatabase::new(db, StatementCacheConfig::default());
//! let db = TracedDatabase::new(db, TracingConfig::default());
//!
//! // Call sites only see the contract
//! db.execute("INSERT INTO users (name) VALUES (?)", &["Alice".into()]).await?;
//! ```
//!
//! Query strings are passed through verbatim. The `native()` accessors reach
//! the driver object at the bottom of the stack for driver-specific calls.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{Driver, DriverConnection, DriverStatement, DriverTransaction, PoolStats, TxOptions};
use crate::error::Result;
use crate::value::{ExecResult, Row, Rows, Value};

/// Query-carrying operations shared by databases, transactions and connections
#[async_trait]
pub trait Queryer: Send + Sync {
    /// Prepare a statement for repeated use
    async fn prepare(&self, query: &str) -> Result<Box<dyn Statement>>;

    /// Execute a statement that returns no rows
    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult>;

    /// Run a query and collect its rows
    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows>;

    /// Run a query expected to return at most one row
    ///
    /// `Ok(None)` means the query succeeded without rows.
    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>>;
}

/// A database handle
#[async_trait]
pub trait Database: Queryer {
    /// Verify the database is reachable
    async fn ping(&self) -> Result<()>;

    /// Close the handle and everything it owns
    async fn close(&self) -> Result<()>;

    /// Limit the number of idle connections
    fn set_max_idle_conns(&self, n: usize);

    /// Limit the number of open connections (0 means unlimited)
    fn set_max_open_conns(&self, n: usize);

    /// Limit how long a connection may be reused (`None` means forever)
    fn set_conn_max_lifetime(&self, d: Option<Duration>);

    /// Limit how long a connection may stay idle (`None` means forever)
    fn set_conn_max_idle_time(&self, d: Option<Duration>);

    /// Current pool statistics
    fn stats(&self) -> PoolStats;

    /// Start a transaction
    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn Transaction>>;

    /// Reserve a single connection
    async fn conn(&self) -> Result<Box<dyn Connection>>;

    /// The native driver at the bottom of the stack
    fn native(&self) -> &dyn Driver;
}

/// A prepared statement
#[async_trait]
pub trait Statement: Send + Sync {
    /// Execute the statement
    async fn execute(&self, args: &[Value]) -> Result<ExecResult>;

    /// Run the statement as a query
    async fn query(&self, args: &[Value]) -> Result<Rows>;

    /// Run the statement as a query expected to return at most one row
    async fn query_row(&self, args: &[Value]) -> Result<Option<Row>>;

    /// Release the statement
    async fn close(&self) -> Result<()>;

    /// The native statement at the bottom of the stack
    fn native(&self) -> &dyn DriverStatement;
}

/// A transaction in progress
#[async_trait]
pub trait Transaction: Queryer {
    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll the transaction back
    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Rebind a statement prepared elsewhere onto this transaction
    async fn adopt(&self, stmt: &dyn Statement) -> Result<Box<dyn Statement>>;

    /// The native transaction at the bottom of the stack
    fn native(&self) -> &dyn DriverTransaction;
}

/// A single reserved connection
#[async_trait]
pub trait Connection: Queryer {
    /// Verify the connection is alive
    async fn ping(&self) -> Result<()>;

    /// Run a callback against the driver-specific connection object
    async fn with_native(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a dyn Any) -> Result<()> + Send),
    ) -> Result<()>;

    /// Start a transaction on this connection
    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn Transaction>>;

    /// Return the connection to its pool
    async fn close(&self) -> Result<()>;

    /// The native connection at the bottom of the stack
    fn native(&self) -> &dyn DriverConnection;
}
