//! Tracing support for instrumented layers
//!
//! This module provides the span vocabulary used by [`crate::traced`]: one
//! `tracing` span per database operation, with fields that line up with
//! OpenTelemetry database conventions so an OpenTelemetry subscriber can
//! export them as is.
//!
//! # Span Fields
//!
//! Every operation span is named `db` and carries:
//! - `otel.name` and `db.operation`: the operation, e.g. "query" or "commit"
//! - `db.system`: the name of the native driver
//! - `db.statement`: query text (optional, truncated to `max_sql_length`)
//! - `db.args`: query arguments (can be turned off when values are sensitive)
//! - `error.class`: failure classification, only set on errors
//! - `duration_ms`: time spent in the wrapped layer
//!
//! # Example
//!
//! ```
//! use sql_layers::tracing_support::{truncate_sql, ErrorClass, TracingConfig};
//!
//! let config = TracingConfig::default().with_params(false);
//! assert!(!config.include_params);
//!
//! assert_eq!(truncate_sql("SELECT * FROM users", 8), "SELECT *...");
//! assert_eq!(ErrorClass::from_http_status(429), ErrorClass::RateLimit);
//! ```

use std::borrow::Cow;
use std::future::Future;
use std::time::Instant;

use tracing::field::Empty;
use tracing::{error, info_span, Instrument, Span};

use crate::error::{DriverErrorKind, Error, Result};
use crate::value::Value;

/// The operation type for spans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanOperation {
    /// Checking that the database is reachable
    Ping,
    /// Closing a handle
    Close,
    /// Changing the idle connection limit
    SetMaxIdleConns,
    /// Changing the open connection limit
    SetMaxOpenConns,
    /// Changing the connection lifetime limit
    SetConnMaxLifetime,
    /// Changing the connection idle time limit
    SetConnMaxIdleTime,
    /// Reading pool statistics
    Stats,
    /// Preparing a statement
    Prepare,
    /// Executing a statement
    Execute,
    /// Running a query
    Query,
    /// Running a single-row query
    QueryRow,
    /// Starting a transaction
    Begin,
    /// Reserving a connection
    Conn,
    /// Committing a transaction
    Commit,
    /// Rolling back a transaction
    Rollback,
    /// Rebinding a statement onto a transaction
    Adopt,
    /// Calling into the native connection
    Raw,
}

impl SpanOperation {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanOperation::Ping => "ping",
            SpanOperation::Close => "close",
            SpanOperation::SetMaxIdleConns => "set_max_idle_conns",
            SpanOperation::SetMaxOpenConns => "set_max_open_conns",
            SpanOperation::SetConnMaxLifetime => "set_conn_max_lifetime",
            SpanOperation::SetConnMaxIdleTime => "set_conn_max_idle_time",
            SpanOperation::Stats => "stats",
            SpanOperation::Prepare => "prepare",
            SpanOperation::Execute => "execute",
            SpanOperation::Query => "query",
            SpanOperation::QueryRow => "query_row",
            SpanOperation::Begin => "begin",
            SpanOperation::Conn => "conn",
            SpanOperation::Commit => "commit",
            SpanOperation::Rollback => "rollback",
            SpanOperation::Adopt => "adopt",
            SpanOperation::Raw => "raw",
        }
    }
}

impl std::fmt::Display for SpanOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error classification for database operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Authentication or authorization error
    Auth,
    /// Rate limiting error (e.g., 429)
    RateLimit,
    /// SQL syntax or execution error
    SqlError,
    /// Response decoding error
    Decode,
    /// Request timeout
    Timeout,
    /// Network or connection error
    Network,
    /// Use of a closed handle or finished transaction
    Closed,
    /// Unknown error
    Unknown,
}

impl ErrorClass {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Auth => "auth",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::SqlError => "sql_error",
            ErrorClass::Decode => "decode",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Network => "network",
            ErrorClass::Closed => "closed",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Classify a crate error
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Driver(driver) => match driver.kind() {
                DriverErrorKind::Connection => ErrorClass::Network,
                DriverErrorKind::Timeout => ErrorClass::Timeout,
                DriverErrorKind::Constraint | DriverErrorKind::Syntax => ErrorClass::SqlError,
                DriverErrorKind::Unknown => Self::from_error_message(driver.message()),
            },
            #[cfg(feature = "http")]
            Error::Http { status, .. } => Self::from_http_status(*status),
            #[cfg(feature = "http")]
            Error::Transport(err) if err.is_timeout() => ErrorClass::Timeout,
            #[cfg(feature = "http")]
            Error::Transport(_) => ErrorClass::Network,
            Error::Decode(_) => ErrorClass::Decode,
            Error::Closed(_) | Error::TransactionDone => ErrorClass::Closed,
            Error::Unsupported(_) | Error::InvalidConfig(_) | Error::CacheFull { .. } => {
                ErrorClass::Unknown
            }
        }
    }

    /// Classify an error from an HTTP status code
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorClass::Auth,
            429 => ErrorClass::RateLimit,
            400 => ErrorClass::SqlError,
            408 | 504 => ErrorClass::Timeout,
            502 | 503 | 520..=530 => ErrorClass::Network,
            _ => ErrorClass::Unknown,
        }
    }

    /// Classify an error from an error message
    pub fn from_error_message(message: &str) -> Self {
        let msg_lower = message.to_lowercase();

        if msg_lower.contains("unauthorized")
            || msg_lower.contains("forbidden")
            || msg_lower.contains("auth")
        {
            ErrorClass::Auth
        } else if msg_lower.contains("rate limit") || msg_lower.contains("too many requests") {
            ErrorClass::RateLimit
        } else if msg_lower.contains("syntax")
            || msg_lower.contains("sql")
            || msg_lower.contains("constraint")
            || msg_lower.contains("duplicate")
        {
            ErrorClass::SqlError
        } else if msg_lower.contains("parse")
            || msg_lower.contains("decode")
            || msg_lower.contains("deserialize")
        {
            ErrorClass::Decode
        } else if msg_lower.contains("timeout") || msg_lower.contains("timed out") {
            ErrorClass::Timeout
        } else if msg_lower.contains("network")
            || msg_lower.contains("connection")
            || msg_lower.contains("connect")
        {
            ErrorClass::Network
        } else if msg_lower.contains("closed") {
            ErrorClass::Closed
        } else {
            ErrorClass::Unknown
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration for tracing
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to include SQL statements in spans
    pub include_sql: bool,
    /// Whether to include parameter values (potentially sensitive)
    pub include_params: bool,
    /// Maximum SQL length to include in spans
    pub max_sql_length: usize,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            include_sql: true,
            include_params: true,
            max_sql_length: 1000,
        }
    }
}

impl TracingConfig {
    /// Include or omit SQL text
    pub fn with_sql(mut self, include: bool) -> Self {
        self.include_sql = include;
        self
    }

    /// Include or omit argument values
    pub fn with_params(mut self, include: bool) -> Self {
        self.include_params = include;
        self
    }

    /// Set the maximum SQL length recorded
    pub fn with_max_sql_length(mut self, max: usize) -> Self {
        self.max_sql_length = max;
        self
    }

    /// Record the query text on a span, if enabled
    pub fn record_statement(&self, span: &Span, query: &str) {
        if self.include_sql {
            let statement = truncate_sql(query, self.max_sql_length);
            span.record("db.statement", &*statement);
        }
    }

    /// Record argument values on a span, if enabled
    pub fn record_args(&self, span: &Span, args: &[Value]) {
        if self.include_params {
            span.record("db.args", render_args(args).as_str());
        }
    }
}

/// Shorten SQL to at most `max` characters, marking the cut with `...`
pub fn truncate_sql(sql: &str, max: usize) -> Cow<'_, str> {
    match sql.char_indices().nth(max) {
        Some((cut, _)) => Cow::Owned(format!("{}...", &sql[..cut])),
        None => Cow::Borrowed(sql),
    }
}

/// Render arguments as a bracketed list
pub fn render_args(args: &[Value]) -> String {
    let rendered: Vec<String> = args.iter().map(Value::to_string).collect();
    format!("[{}]", rendered.join(", "))
}

/// Create the span for one operation
///
/// Statement, argument, error and duration fields start empty and are filled
/// in by [`TracingConfig`] and [`observe`].
pub fn operation_span(operation: SpanOperation, system: &str) -> Span {
    info_span!(
        "db",
        otel.name = operation.as_str(),
        db.operation = operation.as_str(),
        db.system = system,
        db.statement = Empty,
        db.args = Empty,
        error.class = Empty,
        duration_ms = Empty,
    )
}

/// Helper to time an operation and annotate its span
pub struct SpanTimer {
    start: Instant,
    span: Span,
}

impl SpanTimer {
    /// Start timing an operation
    pub fn start(span: Span) -> Self {
        Self {
            start: Instant::now(),
            span,
        }
    }

    /// Get the span being timed
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Record the duration and, on failure, the error class and an error event
    pub fn finish<T>(self, result: &Result<T>) {
        let elapsed = self.start.elapsed();
        self.span.record("duration_ms", elapsed.as_secs_f64() * 1000.0);

        if let Err(err) = result {
            let class = ErrorClass::from_error(err);
            self.span.record("error.class", class.as_str());
            error!(parent: &self.span, error.class = class.as_str(), error = %err, "database operation failed");
        }
    }
}

/// Run a future inside an operation span and record its outcome
///
/// The result is returned unchanged.
pub async fn observe<T, F>(span: Span, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let timer = SpanTimer::start(span);
    let result = fut.instrument(timer.span().clone()).await;
    timer.finish(&result);
    result
}
