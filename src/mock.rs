//! In-memory scripted driver for tests.
//!
//! Every call is counted in a shared [`MockState`], and failures and delays can
//! be scripted per query or for the next statement call.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{Driver, DriverConnection, DriverStatement, DriverTransaction, PoolStats, TxOptions};
use crate::error::{DriverError, DriverErrorKind, Error, Result};
use crate::value::{ExecResult, Rows, Value};

/// Shared counters and scripted behavior.
#[derive(Default)]
pub struct MockState {
    prepares: AtomicUsize,
    prepare_failures: AtomicUsize,
    direct_executes: AtomicUsize,
    direct_queries: AtomicUsize,
    statement_calls: AtomicUsize,
    statement_closes: AtomicUsize,
    adopts: AtomicUsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    conn_closes: AtomicUsize,
    closes: AtomicUsize,
    max_open: AtomicUsize,
    fail_prepare: Mutex<HashSet<String>>,
    fail_direct: AtomicBool,
    fail_next_statement_call: AtomicBool,
    fail_statement_close: AtomicBool,
    prepare_delay: Mutex<Option<Duration>>,
}

fn strip(query: &str) -> &str {
    query.trim().trim_end_matches(';')
}

impl MockState {
    pub fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn prepare_failures(&self) -> usize {
        self.prepare_failures.load(Ordering::SeqCst)
    }

    pub fn direct_executes(&self) -> usize {
        self.direct_executes.load(Ordering::SeqCst)
    }

    pub fn direct_queries(&self) -> usize {
        self.direct_queries.load(Ordering::SeqCst)
    }

    pub fn statement_calls(&self) -> usize {
        self.statement_calls.load(Ordering::SeqCst)
    }

    pub fn statement_closes(&self) -> usize {
        self.statement_closes.load(Ordering::SeqCst)
    }

    pub fn adopts(&self) -> usize {
        self.adopts.load(Ordering::SeqCst)
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn conn_closes(&self) -> usize {
        self.conn_closes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Make every prepare of this query fail; matching ignores surrounding
    /// whitespace and trailing delimiters.
    pub fn fail_prepare_for(&self, query: &str) {
        if let Ok(mut set) = self.fail_prepare.lock() {
            set.insert(strip(query).to_string());
        }
    }

    /// Make direct (unprepared) calls fail.
    pub fn set_fail_direct(&self, fail: bool) {
        self.fail_direct.store(fail, Ordering::SeqCst);
    }

    /// Make the next call on any statement fail.
    pub fn fail_next_statement_call(&self) {
        self.fail_next_statement_call.store(true, Ordering::SeqCst);
    }

    /// Make statement close report an error (the statement still counts as closed).
    pub fn set_fail_statement_close(&self, fail: bool) {
        self.fail_statement_close.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside every prepare.
    pub fn set_prepare_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.prepare_delay.lock() {
            *d = Some(delay);
        }
    }

    async fn prepare(self: &Arc<Self>, query: &str) -> Result<Box<dyn DriverStatement>> {
        let delay = self.prepare_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .fail_prepare
            .lock()
            .map(|set| set.contains(strip(query)))
            .unwrap_or(false);
        if failing {
            self.prepare_failures.fetch_add(1, Ordering::SeqCst);
            return Err(DriverError::new(
                DriverErrorKind::Syntax,
                format!("cannot prepare {query}"),
            )
            .into());
        }

        self.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockStatement::new(query, Arc::clone(self))))
    }

    fn direct(&self, counter: &AtomicUsize) -> Result<()> {
        if self.fail_direct.load(Ordering::SeqCst) {
            return Err(DriverError::new(DriverErrorKind::Connection, "connection reset").into());
        }
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute(&self, args: &[Value]) -> Result<ExecResult> {
        self.direct(&self.direct_executes)?;
        Ok(ExecResult::new(args.len() as u64))
    }

    fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.direct(&self.direct_queries)?;
        Ok(rows_for(query, args))
    }
}

/// One row echoing the query text and the number of arguments, or no rows at
/// all for queries mentioning `no_rows`.
fn rows_for(query: &str, args: &[Value]) -> Rows {
    let columns = vec!["query".to_string(), "arg_count".to_string()];
    if query.contains("no_rows") {
        return Rows::new(columns, vec![]);
    }
    Rows::new(
        columns,
        vec![vec![Value::from(query), Value::Integer(args.len() as i64)]],
    )
}

/// Scripted native driver.
#[derive(Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_max_idle_conns(&self, _n: usize) {}

    fn set_max_open_conns(&self, n: usize) {
        self.state.max_open.store(n, Ordering::SeqCst);
    }

    fn set_conn_max_lifetime(&self, _d: Option<Duration>) {}

    fn set_conn_max_idle_time(&self, _d: Option<Duration>) {}

    fn stats(&self) -> PoolStats {
        PoolStats {
            max_open_connections: self.state.max_open.load(Ordering::SeqCst),
            ..PoolStats::default()
        }
    }

    async fn prepare(&self, query: &str) -> Result<Box<dyn DriverStatement>> {
        self.state.prepare(query).await
    }

    async fn execute(&self, _query: &str, args: &[Value]) -> Result<ExecResult> {
        self.state.execute(args)
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.state.query(query, args)
    }

    async fn begin(&self, _opts: TxOptions) -> Result<Box<dyn DriverTransaction>> {
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransaction {
            state: Arc::clone(&self.state),
        }))
    }

    async fn conn(&self) -> Result<Box<dyn DriverConnection>> {
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Statement produced by [`MockDriver`].
pub struct MockStatement {
    query: String,
    state: Arc<MockState>,
    closed: AtomicBool,
}

impl MockStatement {
    fn new(query: &str, state: Arc<MockState>) -> Self {
        Self {
            query: query.to_string(),
            state,
            closed: AtomicBool::new(false),
        }
    }

    pub fn query_text(&self) -> &str {
        &self.query
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn call(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("statement"));
        }
        if self.state.fail_next_statement_call.swap(false, Ordering::SeqCst) {
            return Err(DriverError::new(DriverErrorKind::Connection, "bad connection").into());
        }
        self.state.statement_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DriverStatement for MockStatement {
    async fn execute(&self, args: &[Value]) -> Result<ExecResult> {
        self.call()?;
        Ok(ExecResult::new(args.len() as u64))
    }

    async fn query(&self, args: &[Value]) -> Result<Rows> {
        self.call()?;
        Ok(rows_for(&self.query, args))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.statement_closes.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_statement_close.load(Ordering::SeqCst) {
            return Err(Error::driver("close failed"));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Transaction produced by [`MockDriver`].
pub struct MockTransaction {
    state: Arc<MockState>,
}

#[async_trait]
impl DriverTransaction for MockTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn prepare(&self, query: &str) -> Result<Box<dyn DriverStatement>> {
        self.state.prepare(query).await
    }

    async fn adopt(&self, stmt: &dyn DriverStatement) -> Result<Box<dyn DriverStatement>> {
        let source = stmt
            .as_any()
            .downcast_ref::<MockStatement>()
            .ok_or_else(|| Error::Unsupported("foreign statement".to_string()))?;
        self.state.adopts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockStatement::new(
            source.query_text(),
            Arc::clone(&self.state),
        )))
    }

    async fn execute(&self, _query: &str, args: &[Value]) -> Result<ExecResult> {
        self.state.execute(args)
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.state.query(query, args)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Connection produced by [`MockDriver`].
pub struct MockConnection {
    state: Arc<MockState>,
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _query: &str, args: &[Value]) -> Result<ExecResult> {
        self.state.execute(args)
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.state.query(query, args)
    }

    async fn prepare(&self, query: &str) -> Result<Box<dyn DriverStatement>> {
        self.state.prepare(query).await
    }

    async fn raw(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a dyn Any) -> Result<()> + Send),
    ) -> Result<()> {
        f(self)
    }

    async fn begin(&self, _opts: TxOptions) -> Result<Box<dyn DriverTransaction>> {
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransaction {
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.state.conn_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
