//! # SQL Layers
//!
//! Composable layers around a SQL database handle. Every layer implements the
//! same capability contract ([`Database`], [`Statement`], [`Transaction`] and
//! [`Connection`]), so layers stack in any order and call sites never know
//! which ones are present.
//!
//! - [`BaseDatabase`] sits at the bottom and forwards to a native [`Driver`]
//! - [`CachedDatabase`] prepares each distinct query once and reuses it
//! - [`TracedDatabase`] wraps every operation in a `tracing` span
//!
//! ## Features
//!
//! - `http` - Enable the Cloudflare D1 REST driver
//!
//! ## Usage
//!
//! ```
//! use sql_layers::{
//!     BaseDatabase, CachedDatabase, Database, Driver, StatementCacheConfig, TracedDatabase,
//!     TracingConfig,
//! };
//!
//! fn stack<D: Driver>(driver: D) -> impl Database {
//!     let db = BaseDatabase::new(driver);
//!     let db = CachedDatabase::new(db, StatementCacheConfig::default());
//!     TracedDatabase::new(db, TracingConfig::default().with_max_sql_length(500))
//! }
//! ```

pub mod base;
pub mod cache;
pub mod cached;
pub mod concurrency;
pub mod contract;
pub mod driver;
pub mod error;
pub mod traced;
pub mod tracing_support;
pub mod value;

// HTTP-specific modules
#[cfg(feature = "http")]
pub mod http_driver;

#[cfg(test)]
mod mock;

// Re-exports
pub use base::{BaseConnection, BaseDatabase, BaseStatement, BaseTransaction};
pub use cache::{CacheStatsSnapshot, StatementCache, StatementCacheConfig};
pub use cached::{CachedConnection, CachedDatabase, CachedTransaction};
pub use contract::{Connection, Database, Queryer, Statement, Transaction};
pub use driver::{
    Driver, DriverConnection, DriverStatement, DriverTransaction, IsolationLevel, PoolStats,
    TxOptions,
};
pub use error::{DriverError, DriverErrorKind, Error, Result};
pub use traced::{TracedConnection, TracedDatabase, TracedStatement, TracedTransaction};
pub use tracing_support::{ErrorClass, TracingConfig};
pub use value::{ExecResult, Row, Rows, Value};

#[cfg(feature = "http")]
pub use http_driver::{D1HttpConfig, D1HttpDriver};
