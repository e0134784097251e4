//! Cloudflare D1 driver over the REST API
//!
//! This module provides [`D1HttpDriver`], a native [`Driver`] that talks to a
//! D1 database through the Cloudflare REST API. It can sit at the bottom of a
//! layer stack like any other driver.
//!
//! # D1 Semantics
//!
//! - D1 has no server-side prepared statements. Preparing records the SQL
//!   and sends it with every execution.
//! - D1 has no interactive transactions. Writes issued inside a transaction
//!   are queued and sent as one atomic batch on commit; rollback discards the
//!   queue. Reads inside a transaction run immediately against committed data.
//! - There are no sockets to pool. `set_max_open_conns` caps in-flight
//!   requests, the idle settings tune the reqwest keep-alive pool.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::concurrency::{HttpTransportPolicy, QueryConcurrencyPolicy};
use crate::driver::{
    Driver, DriverConnection, DriverStatement, DriverTransaction, IsolationLevel, PoolStats,
    TxOptions,
};
use crate::error::{DriverError, DriverErrorKind, Error, Result};
use crate::value::{ExecResult, Rows, Value};

/// Default Cloudflare API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

const URL_SCHEME: &str = "d1://";
const URL_FORMAT_HINT: &str = "expected d1://account_id:api_token@database_id";
const PING_QUERY: &str = "SELECT 1";

/// Configuration for D1 HTTP API access
///
/// # Example
///
/// ```
/// use sql_layers::http_driver::D1HttpConfig;
///
/// let config = D1HttpConfig::new("your-account-id", "your-database-id", "your-api-token");
/// assert!(config.base_url.contains("cloudflare.com"));
///
/// let config = D1HttpConfig::from_url("d1://account:token%40x@database").unwrap();
/// assert_eq!(config.api_token, "token@x");
/// ```
#[derive(Clone)]
pub struct D1HttpConfig {
    /// Cloudflare account ID
    pub account_id: String,
    /// D1 database ID
    pub database_id: String,
    /// API token with D1 permissions
    pub api_token: String,
    /// Base URL for the API (defaults to Cloudflare API)
    pub base_url: String,
}

impl D1HttpConfig {
    /// Create a new configuration with the required parameters
    pub fn new(
        account_id: impl Into<String>,
        database_id: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            database_id: database_id.into(),
            api_token: api_token.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Set a custom base URL (useful for testing)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Parse a `d1://account_id:api_token@database_id` URL
    ///
    /// The token may contain `@` or `:` if percent-encoded.
    pub fn from_url(url: &str) -> Result<Self> {
        let body = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| Error::InvalidConfig(format!("D1 URL must start with '{URL_SCHEME}'")))?;

        // The last '@' separates credentials from the database
        let (auth, database_id) = body
            .rsplit_once('@')
            .ok_or_else(|| Error::InvalidConfig(URL_FORMAT_HINT.to_string()))?;
        let (account_id, token_encoded) = auth
            .split_once(':')
            .ok_or_else(|| Error::InvalidConfig(URL_FORMAT_HINT.to_string()))?;
        let api_token = percent_decode(token_encoded);

        if account_id.is_empty() {
            return Err(Error::InvalidConfig("account_id cannot be empty in D1 URL".to_string()));
        }
        if database_id.is_empty() {
            return Err(Error::InvalidConfig("database_id cannot be empty in D1 URL".to_string()));
        }
        if api_token.is_empty() {
            return Err(Error::InvalidConfig("api_token cannot be empty in D1 URL".to_string()));
        }

        Ok(Self::new(account_id, database_id, api_token))
    }

    /// Build the query URL for this database
    fn query_url(&self) -> String {
        format!(
            "{}/accounts/{}/d1/database/{}/query",
            self.base_url.trim_end_matches('/'),
            self.account_id,
            self.database_id
        )
    }
}

impl std::fmt::Debug for D1HttpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("D1HttpConfig")
            .field("account_id", &self.account_id)
            .field("database_id", &self.database_id)
            .field("api_token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// One statement of a D1 API request
#[derive(Serialize, Debug)]
struct D1QueryRequest {
    sql: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    params: Vec<serde_json::Value>,
}

impl D1QueryRequest {
    fn new(sql: &str, args: &[Value]) -> Self {
        Self {
            sql: sql.to_string(),
            params: args.iter().map(Value::to_json_value).collect(),
        }
    }
}

/// D1 HTTP API request body
#[derive(Serialize, Debug)]
#[serde(untagged)]
enum D1Request {
    Single(D1QueryRequest),
    Batch { batch: Vec<D1QueryRequest> },
}

/// D1 HTTP API response
#[derive(Deserialize, Debug)]
struct D1ApiResponse {
    success: bool,
    #[serde(default)]
    errors: Vec<D1ApiError>,
    result: Option<Vec<D1QueryResult>>,
}

/// D1 API error
#[derive(Deserialize, Debug)]
struct D1ApiError {
    message: String,
}

/// D1 query result
#[derive(Deserialize, Debug, Default)]
struct D1QueryResult {
    results: Option<Vec<serde_json::Value>>,
    meta: Option<D1QueryMeta>,
}

/// D1 query metadata
#[derive(Deserialize, Debug, Default)]
struct D1QueryMeta {
    changes: Option<u64>,
    last_row_id: Option<i64>,
    duration: Option<f64>,
}

impl D1QueryResult {
    fn exec_result(&self) -> ExecResult {
        let meta = self.meta.as_ref();
        ExecResult {
            rows_affected: meta.and_then(|m| m.changes).unwrap_or(0),
            last_insert_id: meta.and_then(|m| m.last_row_id),
        }
    }

    fn into_rows(self) -> Result<Rows> {
        decode_rows(self.results.unwrap_or_default())
    }
}

/// Turn D1 result objects into rows
///
/// Columns are the sorted keys of the first object, so field order does not
/// depend on JSON object iteration order.
fn decode_rows(results: Vec<serde_json::Value>) -> Result<Rows> {
    let columns: Vec<String> = match results.first() {
        Some(serde_json::Value::Object(first)) => {
            let mut keys: Vec<String> = first.keys().cloned().collect();
            keys.sort();
            keys
        }
        Some(other) => {
            return Err(Error::Decode(format!("expected a row object, got {other}")));
        }
        None => return Ok(Rows::empty()),
    };

    let mut rows = Vec::with_capacity(results.len());
    for result in results {
        let serde_json::Value::Object(mut object) = result else {
            return Err(Error::Decode("expected a row object".to_string()));
        };
        let values = columns
            .iter()
            .map(|column| object.remove(column).map(Value::from_json).unwrap_or(Value::Null))
            .collect();
        rows.push(values);
    }
    Ok(Rows::new(columns, rows))
}

/// Parse a D1 API response body
fn parse_response(body: &str) -> Result<Vec<D1QueryResult>> {
    let response: D1ApiResponse = serde_json::from_str(body)
        .map_err(|e| Error::Decode(format!("failed to parse response: {e}")))?;

    if !response.success {
        let message = response
            .errors
            .into_iter()
            .next()
            .map(|e| e.message)
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(DriverError::new(classify_message(&message), message).into());
    }

    Ok(response.result.unwrap_or_default())
}

fn classify_message(message: &str) -> DriverErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("constraint") {
        DriverErrorKind::Constraint
    } else if lower.contains("syntax") || lower.contains("no such") {
        DriverErrorKind::Syntax
    } else if lower.contains("timeout") || lower.contains("timed out") {
        DriverErrorKind::Timeout
    } else {
        DriverErrorKind::Unknown
    }
}

fn is_retryable(err: &Error) -> bool {
    match err {
        Error::Http { status, .. } => matches!(status, 429 | 502 | 503 | 504),
        Error::Transport(e) => e.is_connect() || e.is_timeout(),
        _ => false,
    }
}

struct Transport {
    policy: HttpTransportPolicy,
    client: Client,
}

/// State shared by the driver and everything it hands out
struct DriverInner {
    config: D1HttpConfig,
    transport: RwLock<Transport>,
    governor: QueryConcurrencyPolicy,
    conn_max_lifetime: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl DriverInner {
    fn client(&self) -> Client {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .client
            .clone()
    }

    fn policy(&self) -> HttpTransportPolicy {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .policy
            .clone()
    }

    fn update_transport(&self, change: impl FnOnce(&mut HttpTransportPolicy)) {
        let mut transport = self.transport.write().unwrap_or_else(PoisonError::into_inner);
        let mut policy = transport.policy.clone();
        change(&mut policy);
        match policy.create_client() {
            Ok(client) => {
                *transport = Transport { policy, client };
            }
            Err(err) => warn!(error = %err, "failed to rebuild D1 HTTP client, keeping previous settings"),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("database"));
        }
        Ok(())
    }

    async fn send(&self, request: &D1Request) -> Result<Vec<D1QueryResult>> {
        self.ensure_open()?;
        let _permit = self.governor.acquire().await;
        let policy = self.policy();
        let client = self.client();

        let mut attempt = 0;
        loop {
            match self.send_once(&client, request).await {
                Err(err)
                    if policy.retry_enabled()
                        && attempt < policy.max_retries()
                        && is_retryable(&err) =>
                {
                    let delay = policy.retry_delay(attempt);
                    attempt += 1;
                    debug!(attempt, ?delay, error = %err, "retrying D1 request");
                    tokio::time::sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }

    async fn send_once(&self, client: &Client, request: &D1Request) -> Result<Vec<D1QueryResult>> {
        let response = client
            .post(self.config.query_url())
            .bearer_auth(&self.config.api_token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                body,
            });
        }

        let results = parse_response(&body)?;
        for meta in results.iter().filter_map(|r| r.meta.as_ref()) {
            trace!(duration_ms = ?meta.duration, changes = ?meta.changes, "D1 statement finished");
        }
        Ok(results)
    }

    async fn run(&self, sql: &str, args: &[Value]) -> Result<D1QueryResult> {
        trace!(sql, params = args.len(), "sending D1 query");
        let request = D1Request::Single(D1QueryRequest::new(sql, args));
        self.send(&request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Decode("no result returned".to_string()))
    }

    async fn run_batch(&self, batch: Vec<D1QueryRequest>) -> Result<Vec<D1QueryResult>> {
        self.send(&D1Request::Batch { batch }).await
    }

    async fn execute(&self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        Ok(self.run(sql, args).await?.exec_result())
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Rows> {
        self.run(sql, args).await?.into_rows()
    }

    fn begin(self: &Arc<Self>, opts: TxOptions) -> Result<Box<dyn DriverTransaction>> {
        self.ensure_open()?;
        if !matches!(
            opts.isolation,
            IsolationLevel::Default | IsolationLevel::Serializable
        ) {
            return Err(Error::Unsupported(format!(
                "D1 transactions are serializable, {} was requested",
                opts.isolation
            )));
        }
        debug!(read_only = opts.read_only, "starting D1 transaction");
        Ok(Box::new(D1HttpTransaction {
            state: Arc::new(TxState {
                driver: Arc::clone(self),
                read_only: opts.read_only,
                queue: Mutex::new(Vec::new()),
                done: AtomicBool::new(false),
            }),
        }))
    }
}

/// Native driver for Cloudflare D1 over HTTP
///
/// # Example
///
/// ```ignore
/// use sql_layers::http_driver::{D1HttpConfig, D1HttpDriver};
///
/// let driver = D1HttpDriver::new(D1HttpConfig::new("account-id", "database-id", "api-token"))?;
/// let db = BaseDatabase::new(driver);
/// ```
pub struct D1HttpDriver {
    inner: Arc<DriverInner>,
}

impl D1HttpDriver {
    /// Create a driver with the default transport policy
    pub fn new(config: D1HttpConfig) -> Result<Self> {
        Self::with_transport(config, HttpTransportPolicy::default())
    }

    /// Create a driver from a `d1://` URL
    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(D1HttpConfig::from_url(url)?)
    }

    /// Create a driver with a custom transport policy
    pub fn with_transport(config: D1HttpConfig, policy: HttpTransportPolicy) -> Result<Self> {
        let client = policy.create_client()?;
        Ok(Self::build(config, policy, client))
    }

    /// Create a driver with a custom reqwest client
    ///
    /// Changing idle pool settings later replaces this client with one built
    /// from the default transport policy.
    pub fn with_client(config: D1HttpConfig, client: Client) -> Self {
        Self::build(config, HttpTransportPolicy::default(), client)
    }

    fn build(config: D1HttpConfig, policy: HttpTransportPolicy, client: Client) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                config,
                transport: RwLock::new(Transport { policy, client }),
                governor: QueryConcurrencyPolicy::unlimited(),
                conn_max_lifetime: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The driver configuration
    pub fn config(&self) -> &D1HttpConfig {
        &self.inner.config
    }

    /// The transport policy currently in use
    pub fn transport_policy(&self) -> HttpTransportPolicy {
        self.inner.policy()
    }

    /// The connection lifetime limit last set
    ///
    /// HTTP keep-alive connections are recycled by the transport, so this is
    /// recorded for reporting only.
    pub fn conn_max_lifetime(&self) -> Option<Duration> {
        *self
            .inner
            .conn_max_lifetime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Driver for D1HttpDriver {
    fn name(&self) -> &'static str {
        "d1"
    }

    async fn ping(&self) -> Result<()> {
        self.inner.run(PING_QUERY, &[]).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        debug!(database_id = %self.inner.config.database_id, "D1 driver closed");
        Ok(())
    }

    fn set_max_idle_conns(&self, n: usize) {
        self.inner
            .update_transport(|policy| policy.set_pool_idle_connections(n));
    }

    fn set_max_open_conns(&self, n: usize) {
        self.inner.governor.set_max_concurrent_queries(n);
    }

    fn set_conn_max_lifetime(&self, d: Option<Duration>) {
        *self
            .inner
            .conn_max_lifetime
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = d;
    }

    fn set_conn_max_idle_time(&self, d: Option<Duration>) {
        self.inner
            .update_transport(|policy| policy.set_pool_idle_timeout(d));
    }

    fn stats(&self) -> PoolStats {
        let governor = &self.inner.governor;
        let in_flight = governor.current_in_flight();
        PoolStats {
            max_open_connections: governor.max_concurrent_queries(),
            open_connections: in_flight,
            in_use: in_flight,
            idle: 0,
            wait_count: governor.wait_count(),
            wait_duration: governor.wait_duration(),
            max_idle_closed: 0,
            max_lifetime_closed: 0,
        }
    }

    async fn prepare(&self, query: &str) -> Result<Box<dyn DriverStatement>> {
        self.inner.ensure_open()?;
        Ok(Box::new(D1HttpStatement::new(
            Arc::clone(&self.inner),
            query,
            StatementScope::Pool,
        )))
    }

    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.inner.execute(query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.inner.query(query, args).await
    }

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn DriverTransaction>> {
        self.inner.begin(opts)
    }

    async fn conn(&self) -> Result<Box<dyn DriverConnection>> {
        self.inner.ensure_open()?;
        Ok(Box::new(D1HttpConnection {
            driver: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Where a statement sends its executions
enum StatementScope {
    Pool,
    Tx(Arc<TxState>),
}

/// Client-side prepared statement
pub struct D1HttpStatement {
    driver: Arc<DriverInner>,
    sql: String,
    scope: StatementScope,
    closed: AtomicBool,
}

impl D1HttpStatement {
    fn new(driver: Arc<DriverInner>, sql: &str, scope: StatementScope) -> Self {
        Self {
            driver,
            sql: sql.to_string(),
            scope,
            closed: AtomicBool::new(false),
        }
    }

    /// The SQL text of the statement
    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("statement"));
        }
        Ok(())
    }
}

#[async_trait]
impl DriverStatement for D1HttpStatement {
    async fn execute(&self, args: &[Value]) -> Result<ExecResult> {
        self.ensure_open()?;
        match &self.scope {
            StatementScope::Pool => self.driver.execute(&self.sql, args).await,
            StatementScope::Tx(tx) => tx.enqueue(&self.sql, args),
        }
    }

    async fn query(&self, args: &[Value]) -> Result<Rows> {
        self.ensure_open()?;
        if let StatementScope::Tx(tx) = &self.scope {
            tx.ensure_active()?;
        }
        self.driver.query(&self.sql, args).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Queued writes of one emulated transaction
struct TxState {
    driver: Arc<DriverInner>,
    read_only: bool,
    queue: Mutex<Vec<D1QueryRequest>>,
    done: AtomicBool,
}

impl TxState {
    fn ensure_active(&self) -> Result<()> {
        if self.done.load(Ordering::SeqCst) {
            return Err(Error::TransactionDone);
        }
        Ok(())
    }

    /// Queue a write; its effects are only known after commit
    fn enqueue(&self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        self.ensure_active()?;
        if self.read_only {
            return Err(Error::Unsupported(
                "write statement in a read-only transaction".to_string(),
            ));
        }
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(D1QueryRequest::new(sql, args));
        Ok(ExecResult::default())
    }

    fn finish(&self) -> Result<Vec<D1QueryRequest>> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Err(Error::TransactionDone);
        }
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(std::mem::take(&mut *queue))
    }
}

/// Transaction emulated with a batch sent on commit
pub struct D1HttpTransaction {
    state: Arc<TxState>,
}

impl D1HttpTransaction {
    /// Number of writes waiting for commit
    pub fn queued(&self) -> usize {
        self.state
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl DriverTransaction for D1HttpTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        let batch = self.state.finish()?;
        if batch.is_empty() {
            return Ok(());
        }

        debug!(statements = batch.len(), "committing D1 transaction batch");
        self.state.driver.run_batch(batch).await.map(|_| ())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let discarded = self.state.finish()?;
        debug!(statements = discarded.len(), "D1 transaction rolled back");
        Ok(())
    }

    async fn prepare(&self, query: &str) -> Result<Box<dyn DriverStatement>> {
        self.state.ensure_active()?;
        Ok(Box::new(D1HttpStatement::new(
            Arc::clone(&self.state.driver),
            query,
            StatementScope::Tx(Arc::clone(&self.state)),
        )))
    }

    async fn adopt(&self, stmt: &dyn DriverStatement) -> Result<Box<dyn DriverStatement>> {
        let source = stmt
            .as_any()
            .downcast_ref::<D1HttpStatement>()
            .ok_or_else(|| Error::Unsupported("statement was not prepared by D1".to_string()))?;
        self.prepare(source.sql()).await
    }

    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.state.enqueue(query, args)
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.state.ensure_active()?;
        self.state.driver.query(query, args).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Logical connection over the shared HTTP client
pub struct D1HttpConnection {
    driver: Arc<DriverInner>,
    closed: AtomicBool,
}

impl D1HttpConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("connection"));
        }
        Ok(())
    }
}

#[async_trait]
impl DriverConnection for D1HttpConnection {
    async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        self.driver.run(PING_QUERY, &[]).await.map(|_| ())
    }

    async fn execute(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.ensure_open()?;
        self.driver.execute(query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        self.ensure_open()?;
        self.driver.query(query, args).await
    }

    async fn prepare(&self, query: &str) -> Result<Box<dyn DriverStatement>> {
        self.ensure_open()?;
        Ok(Box::new(D1HttpStatement::new(
            Arc::clone(&self.driver),
            query,
            StatementScope::Pool,
        )))
    }

    /// The callback receives the `reqwest::Client` used for requests
    async fn raw(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a dyn Any) -> Result<()> + Send),
    ) -> Result<()> {
        self.ensure_open()?;
        let client = self.driver.client();
        f(&client)
    }

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn DriverTransaction>> {
        self.ensure_open()?;
        self.driver.begin(opts)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Simple percent-decode for URL parsing
///
/// Invalid or incomplete escapes are kept as written.
fn percent_decode(input: &str) -> String {
    let mut bytes = Vec::with_capacity(input.len());
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if hex.len() == 2 {
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    bytes.push(byte);
                    continue;
                }
            }
            bytes.push(b'%');
            bytes.extend(hex.as_bytes());
        } else {
            let mut buf = [0u8; 4];
            bytes.extend(c.encode_utf8(&mut buf).as_bytes());
        }
    }

    String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}
