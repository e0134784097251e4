//! The innermost layer
//!
//! [`BaseDatabase`] and its companions implement the contract directly on top of
//! a native [`Driver`]. They add no behavior: every call is forwarded as is,
//! errors included, and returned native objects are wrapped so that layers
//! stacked above keep working with them.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::contract::{Connection, Database, Queryer, Statement, Transaction};
use crate::driver::{Driver, DriverConnection, DriverStatement, DriverTransaction, PoolStats, TxOptions};
use crate::error::Result;
use crate::value::{ExecResult, Row, Rows, Value};

/// Database handle that terminates a layer stack
///
/// # Example
///
/// ```ignore
/// let db = BaseDatabase::new(D1HttpDriver::new(config));
/// db.ping().await?;
/// ```
pub struct BaseDatabase {
    native: Arc<dyn Driver>,
}

impl BaseDatabase {
    /// Wrap a native driver
    pub fn new<D: Driver>(driver: D) -> Self {
        Self {
            native: Arc::new(driver),
        }
    }

    /// Wrap a driver that is already shared
    pub fn from_shared(driver: Arc<dyn Driver>) -> Self {
        Self { native: driver }
    }
}

#[async_trait]
impl Queryer for BaseDatabase {
    async fn prepare(&self, query: &str) -> Result<Box<dyn Statement>> {
        let stmt = self.native.prepare(query).await?;
        Ok(Box::new(BaseStatement::new(stmt)))
    }

    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.native.execute(query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.native.query(query, args).await
    }

    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        self.native.query_row(query, args).await
    }
}

#[async_trait]
impl Database for BaseDatabase {
    async fn ping(&self) -> Result<()> {
        self.native.ping().await
    }

    async fn close(&self) -> Result<()> {
        self.native.close().await
    }

    fn set_max_idle_conns(&self, n: usize) {
        self.native.set_max_idle_conns(n)
    }

    fn set_max_open_conns(&self, n: usize) {
        self.native.set_max_open_conns(n)
    }

    fn set_conn_max_lifetime(&self, d: Option<Duration>) {
        self.native.set_conn_max_lifetime(d)
    }

    fn set_conn_max_idle_time(&self, d: Option<Duration>) {
        self.native.set_conn_max_idle_time(d)
    }

    fn stats(&self) -> PoolStats {
        self.native.stats()
    }

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn Transaction>> {
        let tx = self.native.begin(opts).await?;
        Ok(Box::new(BaseTransaction::new(tx)))
    }

    async fn conn(&self) -> Result<Box<dyn Connection>> {
        let conn = self.native.conn().await?;
        Ok(Box::new(BaseConnection::new(conn)))
    }

    fn native(&self) -> &dyn Driver {
        self.native.as_ref()
    }
}

/// Prepared statement holding a native statement
pub struct BaseStatement {
    native: Box<dyn DriverStatement>,
}

impl BaseStatement {
    /// Wrap a native statement
    pub fn new(native: Box<dyn DriverStatement>) -> Self {
        Self { native }
    }
}

#[async_trait]
impl Statement for BaseStatement {
    async fn execute(&self, args: &[Value]) -> Result<ExecResult> {
        self.native.execute(args).await
    }

    async fn query(&self, args: &[Value]) -> Result<Rows> {
        self.native.query(args).await
    }

    async fn query_row(&self, args: &[Value]) -> Result<Option<Row>> {
        self.native.query_row(args).await
    }

    async fn close(&self) -> Result<()> {
        self.native.close().await
    }

    fn native(&self) -> &dyn DriverStatement {
        self.native.as_ref()
    }
}

/// Transaction holding a native transaction
pub struct BaseTransaction {
    native: Box<dyn DriverTransaction>,
}

impl BaseTransaction {
    /// Wrap a native transaction
    pub fn new(native: Box<dyn DriverTransaction>) -> Self {
        Self { native }
    }
}

#[async_trait]
impl Queryer for BaseTransaction {
    async fn prepare(&self, query: &str) -> Result<Box<dyn Statement>> {
        let stmt = self.native.prepare(query).await?;
        Ok(Box::new(BaseStatement::new(stmt)))
    }

    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.native.execute(query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.native.query(query, args).await
    }

    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        self.native.query_row(query, args).await
    }
}

#[async_trait]
impl Transaction for BaseTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.native.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.native.rollback().await
    }

    async fn adopt(&self, stmt: &dyn Statement) -> Result<Box<dyn Statement>> {
        let adopted = self.native.adopt(stmt.native()).await?;
        Ok(Box::new(BaseStatement::new(adopted)))
    }

    fn native(&self) -> &dyn DriverTransaction {
        self.native.as_ref()
    }
}

/// Connection holding a native connection
pub struct BaseConnection {
    native: Box<dyn DriverConnection>,
}

impl BaseConnection {
    /// Wrap a native connection
    pub fn new(native: Box<dyn DriverConnection>) -> Self {
        Self { native }
    }
}

#[async_trait]
impl Queryer for BaseConnection {
    async fn prepare(&self, query: &str) -> Result<Box<dyn Statement>> {
        let stmt = self.native.prepare(query).await?;
        Ok(Box::new(BaseStatement::new(stmt)))
    }

    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.native.execute(query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.native.query(query, args).await
    }

    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        self.native.query_row(query, args).await
    }
}

#[async_trait]
impl Connection for BaseConnection {
    async fn ping(&self) -> Result<()> {
        self.native.ping().await
    }

    async fn with_native(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a dyn Any) -> Result<()> + Send),
    ) -> Result<()> {
        self.native.raw(f).await
    }

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn Transaction>> {
        let tx = self.native.begin(opts).await?;
        Ok(Box::new(BaseTransaction::new(tx)))
    }

    async fn close(&self) -> Result<()> {
        self.native.close().await
    }

    fn native(&self) -> &dyn DriverConnection {
        self.native.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mock::MockDriver;

    #[tokio::test]
    async fn test_base_database_forwards_direct_calls() {
        let driver = MockDriver::new();
        let state = driver.state();
        let db = BaseDatabase::new(driver);

        db.ping().await.unwrap();
        let result = db.execute("INSERT INTO t VALUES (?)", &[1.into()]).await.unwrap();
        assert_eq!(result.rows_affected, 1);

        let rows = db.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);

        assert_eq!(state.direct_executes(), 1);
        assert_eq!(state.direct_queries(), 1);
        assert_eq!(state.prepares(), 0);
    }

    #[tokio::test]
    async fn test_base_database_wraps_statements() {
        let driver = MockDriver::new();
        let state = driver.state();
        let db = BaseDatabase::new(driver);

        let stmt = db.prepare("SELECT ?").await.unwrap();
        let row = stmt.query_row(&["x".into()]).await.unwrap().unwrap();
        assert_eq!(row.get_by_name("query"), Some(&Value::from("SELECT ?")));

        stmt.close().await.unwrap();
        assert_eq!(state.prepares(), 1);
        assert_eq!(state.statement_calls(), 1);
        assert_eq!(state.statement_closes(), 1);
    }

    #[tokio::test]
    async fn test_base_database_propagates_errors_unchanged() {
        let driver = MockDriver::new();
        driver.state().fail_prepare_for("SELECT broken");
        let db = BaseDatabase::new(driver);

        let err = db.prepare("SELECT broken").await.err().unwrap();
        match err {
            Error::Driver(inner) => assert!(inner.message().contains("SELECT broken")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_native_returns_same_object() {
        let db = BaseDatabase::new(MockDriver::new());
        let first = db.native() as *const dyn Driver as *const ();
        let second = db.native() as *const dyn Driver as *const ();
        assert_eq!(first, second);
        assert!(db.native().as_any().downcast_ref::<MockDriver>().is_some());
    }

    #[tokio::test]
    async fn test_transaction_adopts_statement() {
        let driver = MockDriver::new();
        let state = driver.state();
        let db = BaseDatabase::new(driver);

        let stmt = db.prepare("UPDATE t SET v = ?").await.unwrap();
        let tx = db.begin(TxOptions::default()).await.unwrap();
        let adopted = tx.adopt(stmt.as_ref()).await.unwrap();
        adopted.execute(&[2.into()]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(state.adopts(), 1);
        assert_eq!(state.commits(), 1);
    }

    #[tokio::test]
    async fn test_connection_with_native() {
        let db = BaseDatabase::new(MockDriver::new());
        let conn = db.conn().await.unwrap();

        let mut seen = false;
        conn.with_native(&mut |raw: &dyn Any| {
            seen = raw.downcast_ref::<crate::mock::MockConnection>().is_some();
            Ok(())
        })
        .await
        .unwrap();
        assert!(seen);

        conn.ping().await.unwrap();
        conn.close().await.unwrap();
    }
}
