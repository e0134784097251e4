//! Instrumentation layer
//!
//! [`TracedDatabase`] wraps any [`Database`] and runs every operation inside a
//! `db` span (see [`crate::tracing_support`] for its fields). Failures are
//! annotated with an `error` event; results and errors are returned as the
//! wrapped layer produced them.
//!
//! Statements, transactions and connections obtained through a traced
//! database are traced as well.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, Span};

use crate::contract::{Connection, Database, Queryer, Statement, Transaction};
use crate::driver::{Driver, DriverConnection, DriverStatement, DriverTransaction, PoolStats, TxOptions};
use crate::error::Result;
use crate::tracing_support::{observe, operation_span, SpanOperation, TracingConfig};
use crate::value::{ExecResult, Row, Rows, Value};

/// Span factory shared by a traced database and everything it hands out
#[derive(Debug, Clone)]
struct Tracer {
    system: &'static str,
    config: Arc<TracingConfig>,
}

impl Tracer {
    fn span(&self, operation: SpanOperation) -> Span {
        operation_span(operation, self.system)
    }

    fn query_span(&self, operation: SpanOperation, query: &str, args: Option<&[Value]>) -> Span {
        let span = self.span(operation);
        self.config.record_statement(&span, query);
        if let Some(args) = args {
            self.config.record_args(&span, args);
        }
        span
    }
}

/// Database layer that traces every operation
pub struct TracedDatabase<D> {
    inner: D,
    tracer: Tracer,
}

impl<D: Database> TracedDatabase<D> {
    /// Wrap a database; `db.system` is taken from the native driver
    pub fn new(inner: D, config: TracingConfig) -> Self {
        let system = inner.native().name();
        Self {
            inner,
            tracer: Tracer {
                system,
                config: Arc::new(config),
            },
        }
    }

    /// Wrap a database with the default tracing configuration
    pub fn with_defaults(inner: D) -> Self {
        Self::new(inner, TracingConfig::default())
    }

    /// The wrapped layer
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// The tracing configuration
    pub fn config(&self) -> &TracingConfig {
        &self.tracer.config
    }
}

#[async_trait]
impl<D: Database> Queryer for TracedDatabase<D> {
    async fn prepare(&self, query: &str) -> Result<Box<dyn Statement>> {
        let span = self.tracer.query_span(SpanOperation::Prepare, query, None);
        let stmt = observe(span, self.inner.prepare(query)).await?;
        Ok(Box::new(TracedStatement::new(stmt, Some(query), self.tracer.clone())))
    }

    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        let span = self.tracer.query_span(SpanOperation::Execute, query, Some(args));
        observe(span, self.inner.execute(query, args)).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        let span = self.tracer.query_span(SpanOperation::Query, query, Some(args));
        observe(span, self.inner.query(query, args)).await
    }

    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        let span = self.tracer.query_span(SpanOperation::QueryRow, query, Some(args));
        observe(span, self.inner.query_row(query, args)).await
    }
}

#[async_trait]
impl<D: Database> Database for TracedDatabase<D> {
    async fn ping(&self) -> Result<()> {
        observe(self.tracer.span(SpanOperation::Ping), self.inner.ping()).await
    }

    async fn close(&self) -> Result<()> {
        observe(self.tracer.span(SpanOperation::Close), self.inner.close()).await
    }

    fn set_max_idle_conns(&self, n: usize) {
        let span = self.tracer.span(SpanOperation::SetMaxIdleConns);
        let _enter = span.enter();
        debug!(n, "pool setting changed");
        self.inner.set_max_idle_conns(n)
    }

    fn set_max_open_conns(&self, n: usize) {
        let span = self.tracer.span(SpanOperation::SetMaxOpenConns);
        let _enter = span.enter();
        debug!(n, "pool setting changed");
        self.inner.set_max_open_conns(n)
    }

    fn set_conn_max_lifetime(&self, d: Option<Duration>) {
        let span = self.tracer.span(SpanOperation::SetConnMaxLifetime);
        let _enter = span.enter();
        debug!(d = ?d, "pool setting changed");
        self.inner.set_conn_max_lifetime(d)
    }

    fn set_conn_max_idle_time(&self, d: Option<Duration>) {
        let span = self.tracer.span(SpanOperation::SetConnMaxIdleTime);
        let _enter = span.enter();
        debug!(d = ?d, "pool setting changed");
        self.inner.set_conn_max_idle_time(d)
    }

    fn stats(&self) -> PoolStats {
        let span = self.tracer.span(SpanOperation::Stats);
        let _enter = span.enter();
        self.inner.stats()
    }

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn Transaction>> {
        let span = self.tracer.span(SpanOperation::Begin);
        debug!(parent: &span, isolation = %opts.isolation, read_only = opts.read_only, "starting transaction");
        let tx = observe(span, self.inner.begin(opts)).await?;
        Ok(Box::new(TracedTransaction::new(tx, self.tracer.clone())))
    }

    async fn conn(&self) -> Result<Box<dyn Connection>> {
        let conn = observe(self.tracer.span(SpanOperation::Conn), self.inner.conn()).await?;
        Ok(Box::new(TracedConnection::new(conn, self.tracer.clone())))
    }

    fn native(&self) -> &dyn Driver {
        self.inner.native()
    }
}

/// Statement that traces every call with its query text
pub struct TracedStatement {
    inner: Box<dyn Statement>,
    query: Option<String>,
    tracer: Tracer,
}

impl TracedStatement {
    fn new(inner: Box<dyn Statement>, query: Option<&str>, tracer: Tracer) -> Self {
        Self {
            inner,
            query: query.map(str::to_string),
            tracer,
        }
    }

    // Adopted statements have no known query text
    fn span(&self, operation: SpanOperation, args: Option<&[Value]>) -> Span {
        match &self.query {
            Some(query) => self.tracer.query_span(operation, query, args),
            None => {
                let span = self.tracer.span(operation);
                if let Some(args) = args {
                    self.tracer.config.record_args(&span, args);
                }
                span
            }
        }
    }
}

#[async_trait]
impl Statement for TracedStatement {
    async fn execute(&self, args: &[Value]) -> Result<ExecResult> {
        let span = self.span(SpanOperation::Execute, Some(args));
        observe(span, self.inner.execute(args)).await
    }

    async fn query(&self, args: &[Value]) -> Result<Rows> {
        let span = self.span(SpanOperation::Query, Some(args));
        observe(span, self.inner.query(args)).await
    }

    async fn query_row(&self, args: &[Value]) -> Result<Option<Row>> {
        let span = self.span(SpanOperation::QueryRow, Some(args));
        observe(span, self.inner.query_row(args)).await
    }

    async fn close(&self) -> Result<()> {
        let span = self.span(SpanOperation::Close, None);
        observe(span, self.inner.close()).await
    }

    fn native(&self) -> &dyn DriverStatement {
        self.inner.native()
    }
}

/// Transaction that traces every call
pub struct TracedTransaction {
    inner: Box<dyn Transaction>,
    tracer: Tracer,
}

impl TracedTransaction {
    fn new(inner: Box<dyn Transaction>, tracer: Tracer) -> Self {
        Self { inner, tracer }
    }
}

#[async_trait]
impl Queryer for TracedTransaction {
    async fn prepare(&self, query: &str) -> Result<Box<dyn Statement>> {
        let span = self.tracer.query_span(SpanOperation::Prepare, query, None);
        let stmt = observe(span, self.inner.prepare(query)).await?;
        Ok(Box::new(TracedStatement::new(stmt, Some(query), self.tracer.clone())))
    }

    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        let span = self.tracer.query_span(SpanOperation::Execute, query, Some(args));
        observe(span, self.inner.execute(query, args)).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        let span = self.tracer.query_span(SpanOperation::Query, query, Some(args));
        observe(span, self.inner.query(query, args)).await
    }

    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        let span = self.tracer.query_span(SpanOperation::QueryRow, query, Some(args));
        observe(span, self.inner.query_row(query, args)).await
    }
}

#[async_trait]
impl Transaction for TracedTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { inner, tracer } = *self;
        observe(tracer.span(SpanOperation::Commit), inner.commit()).await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let Self { inner, tracer } = *self;
        observe(tracer.span(SpanOperation::Rollback), inner.rollback()).await
    }

    async fn adopt(&self, stmt: &dyn Statement) -> Result<Box<dyn Statement>> {
        let adopted = observe(self.tracer.span(SpanOperation::Adopt), self.inner.adopt(stmt)).await?;
        Ok(Box::new(TracedStatement::new(adopted, None, self.tracer.clone())))
    }

    fn native(&self) -> &dyn DriverTransaction {
        self.inner.native()
    }
}

/// Connection that traces every call
pub struct TracedConnection {
    inner: Box<dyn Connection>,
    tracer: Tracer,
}

impl TracedConnection {
    fn new(inner: Box<dyn Connection>, tracer: Tracer) -> Self {
        Self { inner, tracer }
    }
}

#[async_trait]
impl Queryer for TracedConnection {
    async fn prepare(&self, query: &str) -> Result<Box<dyn Statement>> {
        let span = self.tracer.query_span(SpanOperation::Prepare, query, None);
        let stmt = observe(span, self.inner.prepare(query)).await?;
        Ok(Box::new(TracedStatement::new(stmt, Some(query), self.tracer.clone())))
    }

    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        let span = self.tracer.query_span(SpanOperation::Execute, query, Some(args));
        observe(span, self.inner.execute(query, args)).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        let span = self.tracer.query_span(SpanOperation::Query, query, Some(args));
        observe(span, self.inner.query(query, args)).await
    }

    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        let span = self.tracer.query_span(SpanOperation::QueryRow, query, Some(args));
        observe(span, self.inner.query_row(query, args)).await
    }
}

#[async_trait]
impl Connection for TracedConnection {
    async fn ping(&self) -> Result<()> {
        observe(self.tracer.span(SpanOperation::Ping), self.inner.ping()).await
    }

    async fn with_native(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a dyn Any) -> Result<()> + Send),
    ) -> Result<()> {
        observe(self.tracer.span(SpanOperation::Raw), self.inner.with_native(f)).await
    }

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn Transaction>> {
        let span = self.tracer.span(SpanOperation::Begin);
        debug!(parent: &span, isolation = %opts.isolation, read_only = opts.read_only, "starting transaction");
        let tx = observe(span, self.inner.begin(opts)).await?;
        Ok(Box::new(TracedTransaction::new(tx, self.tracer.clone())))
    }

    async fn close(&self) -> Result<()> {
        observe(self.tracer.span(SpanOperation::Close), self.inner.close()).await
    }

    fn native(&self) -> &dyn DriverConnection {
        self.inner.native()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::BaseDatabase;
    use crate::cache::StatementCacheConfig;
    use crate::cached::CachedDatabase;
    use crate::error::Error;
    use crate::mock::MockDriver;
    use std::io;
    use std::sync::Mutex;
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::fmt::format::FmtSpan;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn contents(&self) -> String {
            self.0
                .lock()
                .map(|buf| String::from_utf8_lossy(&buf).into_owned())
                .unwrap_or_default()
        }
    }

    impl io::Write for Capture {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if let Ok(mut buf) = self.0.lock() {
                buf.extend_from_slice(data);
            }
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_spans() -> (Capture, DefaultGuard) {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .with_span_events(FmtSpan::CLOSE)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    #[tokio::test]
    async fn test_traced_returns_inner_results() {
        let db = TracedDatabase::with_defaults(BaseDatabase::new(MockDriver::new()));

        let rows = db.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows.first().and_then(|row| row.get_by_name("query")),
            Some(&Value::from("SELECT 1"))
        );

        let result = db.execute("DELETE FROM t WHERE id = ?", &[7.into()]).await.unwrap();
        assert_eq!(result.rows_affected, 1);

        let row = db.query_row("SELECT * FROM no_rows", &[]).await.unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn test_traced_returns_inner_errors() {
        let driver = MockDriver::new();
        driver.state().fail_prepare_for("SELECT broken");
        let db = TracedDatabase::with_defaults(BaseDatabase::new(driver));

        let err = db.prepare("SELECT broken").await.err().unwrap();
        match err {
            Error::Driver(inner) => assert_eq!(inner.message(), "cannot prepare SELECT broken"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_span_records_statement_and_args_by_default() {
        let (capture, _guard) = capture_spans();
        let db = TracedDatabase::with_defaults(BaseDatabase::new(MockDriver::new()));

        db.query("SELECT name FROM users WHERE id = ?", &[42.into(), "alice".into()])
            .await
            .unwrap();

        let output = capture.contents();
        assert!(output.contains("db.operation"));
        assert!(output.contains("query"));
        assert!(output.contains("db.system"));
        assert!(output.contains("mock"));
        assert!(output.contains("SELECT name FROM users WHERE id = ?"));
        assert!(output.contains("duration_ms"));
        assert!(output.contains("db.args"));
        assert!(output.contains("[42, 'alice']"));
    }

    #[tokio::test]
    async fn test_span_omits_args_when_disabled() {
        let (capture, _guard) = capture_spans();
        let config = TracingConfig::default().with_params(false);
        let db = TracedDatabase::new(BaseDatabase::new(MockDriver::new()), config);

        db.execute("UPDATE t SET a = ?", &["secret".into()]).await.unwrap();

        let output = capture.contents();
        assert!(output.contains("UPDATE t SET a = ?"));
        assert!(!output.contains("db.args"));
        assert!(!output.contains("secret"));
    }

    #[tokio::test]
    async fn test_span_omits_sql_when_disabled() {
        let (capture, _guard) = capture_spans();
        let config = TracingConfig::default().with_sql(false);
        let db = TracedDatabase::new(BaseDatabase::new(MockDriver::new()), config);

        db.execute("UPDATE hidden_table SET a = 1", &[]).await.unwrap();

        let output = capture.contents();
        assert!(output.contains("execute"));
        assert!(!output.contains("hidden_table"));
    }

    #[tokio::test]
    async fn test_failure_emits_error_event() {
        let (capture, _guard) = capture_spans();
        let driver = MockDriver::new();
        driver.state().fail_prepare_for("SELECT broken");
        let db = TracedDatabase::with_defaults(BaseDatabase::new(driver));

        assert!(db.prepare("SELECT broken").await.is_err());

        let output = capture.contents();
        assert!(output.contains("ERROR"));
        assert!(output.contains("database operation failed"));
        assert!(output.contains("error.class"));
        assert!(output.contains("sql_error"));
    }

    #[tokio::test]
    async fn test_statement_and_transaction_are_traced() {
        let (capture, _guard) = capture_spans();
        let driver = MockDriver::new();
        let state = driver.state();
        let db = TracedDatabase::with_defaults(BaseDatabase::new(driver));

        let stmt = db.prepare("SELECT 1").await.unwrap();
        stmt.query(&[]).await.unwrap();
        stmt.close().await.unwrap();

        let tx = db.begin(TxOptions::default()).await.unwrap();
        tx.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        tx.commit().await.unwrap();

        let output = capture.contents();
        assert!(output.contains("prepare"));
        assert!(output.contains("begin"));
        assert!(output.contains("commit"));
        assert_eq!(state.commits(), 1);
        assert_eq!(state.statement_closes(), 1);
    }

    #[tokio::test]
    async fn test_connection_is_traced() {
        let (capture, _guard) = capture_spans();
        let driver = MockDriver::new();
        let state = driver.state();
        let db = TracedDatabase::with_defaults(BaseDatabase::new(driver));

        let conn = db.conn().await.unwrap();
        conn.ping().await.unwrap();
        let mut calls = 0;
        conn.with_native(&mut |_: &dyn Any| {
            calls += 1;
            Ok(())
        })
        .await
        .unwrap();
        conn.close().await.unwrap();

        assert_eq!(calls, 1);
        assert_eq!(state.conn_closes(), 1);
        let output = capture.contents();
        assert!(output.contains("ping"));
        assert!(output.contains("raw"));
    }

    #[tokio::test]
    async fn test_pool_setters_are_forwarded() {
        let (capture, _guard) = capture_spans();
        let db = TracedDatabase::with_defaults(BaseDatabase::new(MockDriver::new()));

        db.set_max_open_conns(4);
        db.set_max_idle_conns(2);
        db.set_conn_max_lifetime(Some(Duration::from_secs(30)));
        db.set_conn_max_idle_time(None);

        assert_eq!(db.stats().max_open_connections, 4);
        assert!(capture.contents().contains("set_max_open_conns"));
    }

    #[tokio::test]
    async fn test_traced_over_cached() {
        let driver = MockDriver::new();
        let state = driver.state();
        let db = TracedDatabase::with_defaults(CachedDatabase::new(
            BaseDatabase::new(driver),
            StatementCacheConfig::default(),
        ));

        for _ in 0..3 {
            db.query("SELECT 1", &[]).await.unwrap();
        }
        assert_eq!(state.prepares(), 1);
        assert_eq!(db.inner().cache().stats().hits, 2);
    }

    #[tokio::test]
    async fn test_cached_over_traced() {
        let (capture, _guard) = capture_spans();
        let driver = MockDriver::new();
        let state = driver.state();
        let db = CachedDatabase::new(
            TracedDatabase::with_defaults(BaseDatabase::new(driver)),
            StatementCacheConfig::default(),
        );

        for _ in 0..3 {
            db.query("SELECT 1", &[]).await.unwrap();
        }
        assert_eq!(state.prepares(), 1);
        assert_eq!(state.statement_calls(), 3);

        // The cache prepares through the traced layer with the normalized key
        let output = capture.contents();
        assert!(output.contains("prepare"));
        assert!(output.contains("SELECT 1;"));
    }
}
