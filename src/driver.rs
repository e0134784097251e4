//! Native driver boundary
//!
//! These traits are the primitives a database driver exposes to the bottom of a
//! layer stack: open handles, prepare, execute, query, begin, close, stats and a
//! raw escape hatch. [`crate::base`] is the only consumer; everything above it
//! speaks the contract in [`crate::contract`].
//!
//! Drivers own all network behavior. Nothing in this crate speaks a wire
//! protocol except the optional D1 REST driver.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::value::{ExecResult, Row, Rows, Value};

/// Transaction isolation level requested by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Whatever the driver uses by default
    #[default]
    Default,
    /// Read uncommitted
    ReadUncommitted,
    /// Read committed
    ReadCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Serializable
    Serializable,
}

impl IsolationLevel {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::Default => "default",
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Options for starting a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    /// Requested isolation level
    pub isolation: IsolationLevel,
    /// Whether the transaction only reads
    pub read_only: bool,
}

impl TxOptions {
    /// Options for a read-only transaction
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    /// Set the isolation level
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }
}

/// Snapshot of a driver's connection pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Maximum number of open connections (0 means unlimited)
    pub max_open_connections: usize,
    /// Established connections, in use and idle
    pub open_connections: usize,
    /// Connections currently in use
    pub in_use: usize,
    /// Idle connections
    pub idle: usize,
    /// Total number of times a caller waited for a connection
    pub wait_count: u64,
    /// Total time spent waiting for connections
    pub wait_duration: Duration,
    /// Connections closed because of the idle limit
    pub max_idle_closed: u64,
    /// Connections closed because of the lifetime limit
    pub max_lifetime_closed: u64,
}

/// A native database handle, usually backed by a connection pool
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Short name of the driver, used as `db.system` in spans
    fn name(&self) -> &'static str;

    /// Verify the database is reachable
    async fn ping(&self) -> Result<()>;

    /// Close the handle and release its resources
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

    /// Prepare a statement
    async fn prepare(&self, query: &str) -> Result<Box<dyn DriverStatement>>;

    /// Execute a statement that returns no rows
    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult>;

    /// Run a query and collect its rows
    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows>;

    /// Run a query and keep its first row
    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(query, args).await?.into_first())
    }

    /// Start a transaction
    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn DriverTransaction>>;

    /// Reserve a single connection
    async fn conn(&self) -> Result<Box<dyn DriverConnection>>;

    /// Access the concrete driver type
    fn as_any(&self) -> &dyn Any;
}

/// A prepared statement owned by a driver
#[async_trait]
pub trait DriverStatement: Send + Sync + 'static {
    /// Execute the statement
    async fn execute(&self, args: &[Value]) -> Result<ExecResult>;

    /// Run the statement as a query
    async fn query(&self, args: &[Value]) -> Result<Rows>;

    /// Run the statement as a query and keep its first row
    async fn query_row(&self, args: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(args).await?.into_first())
    }

    /// Release the statement
    async fn close(&self) -> Result<()>;

    /// Access the concrete statement type
    fn as_any(&self) -> &dyn Any;
}

/// A transaction owned by a driver
#[async_trait]
pub trait DriverTransaction: Send + Sync + 'static {
    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll the transaction back
    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Prepare a statement bound to this transaction
    async fn prepare(&self, query: &str) -> Result<Box<dyn DriverStatement>>;

    /// Rebind a statement prepared elsewhere onto this transaction
    async fn adopt(&self, stmt: &dyn DriverStatement) -> Result<Box<dyn DriverStatement>>;

    /// Execute a statement that returns no rows
    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult>;

    /// Run a query and collect its rows
    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows>;

    /// Run a query and keep its first row
    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(query, args).await?.into_first())
    }

    /// Access the concrete transaction type
    fn as_any(&self) -> &dyn Any;
}

/// A single reserved connection owned by a driver
#[async_trait]
pub trait DriverConnection: Send + Sync + 'static {
    /// Verify the connection is alive
    async fn ping(&self) -> Result<()>;

    /// Execute a statement that returns no rows
    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult>;

    /// Run a query and collect its rows
    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows>;

    /// Run a query and keep its first row
    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(query, args).await?.into_first())
    }

    /// Prepare a statement on this connection
    async fn prepare(&self, query: &str) -> Result<Box<dyn DriverStatement>>;

    /// Run a callback against the driver-specific connection object
    async fn raw(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a dyn Any) -> Result<()> + Send),
    ) -> Result<()>;

    /// Start a transaction on this connection
    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn DriverTransaction>>;

    /// Return the connection to its pool
    async fn close(&self) -> Result<()>;

    /// Access the concrete connection type
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_options_default() {
        let opts = TxOptions::default();
        assert_eq!(opts.isolation, IsolationLevel::Default);
        assert!(!opts.read_only);
    }

    #[test]
    fn test_tx_options_builders() {
        let opts = TxOptions::read_only().with_isolation(IsolationLevel::Serializable);
        assert!(opts.read_only);
        assert_eq!(opts.isolation, IsolationLevel::Serializable);
    }

    #[test]
    fn test_isolation_level_as_str() {
        assert_eq!(IsolationLevel::Default.as_str(), "default");
        assert_eq!(IsolationLevel::RepeatableRead.as_str(), "repeatable_read");
        assert_eq!(IsolationLevel::Serializable.to_string(), "serializable");
    }
}
