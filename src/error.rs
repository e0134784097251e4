//! Error types shared by every layer
//!
//! All layers of a stack report failures through [`Error`]. Errors raised by a
//! native driver travel up the stack untouched, so a caller sees the same error
//! whether it talks to the driver directly or through caching and tracing layers.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad category of a native driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// The connection to the database failed or was dropped
    Connection,
    /// The database did not answer in time
    Timeout,
    /// A constraint (unique, foreign key, not null, ...) was violated
    Constraint,
    /// The statement could not be parsed or planned
    Syntax,
    /// Anything the driver could not categorize
    Unknown,
}

impl DriverErrorKind {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverErrorKind::Connection => "connection",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Constraint => "constraint",
            DriverErrorKind::Syntax => "syntax",
            DriverErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error information reported by a native driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    kind: DriverErrorKind,
    message: String,
}

impl DriverError {
    /// Create a new driver error with the given kind and message
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an uncategorized driver error
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Unknown, message)
    }

    /// The category of the failure
    pub fn kind(&self) -> DriverErrorKind {
        self.kind
    }

    /// The message reported by the driver
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DriverError {}

/// Errors that can occur while talking to a database through a layer stack.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure reported by the native driver.
    #[error("driver error ({}): {}", .0.kind(), .0)]
    Driver(#[from] DriverError),

    /// The remote API answered with a non-success HTTP status.
    #[cfg(feature = "http")]
    #[error("HTTP error {status}: {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body as returned by the server
        body: String,
    },

    /// The HTTP request could not be sent or its body could not be read.
    #[cfg(feature = "http")]
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The named resource was already closed.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// The transaction was already committed or rolled back.
    #[error("transaction has already been committed or rolled back")]
    TransactionDone,

    /// The driver does not support the requested feature.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The statement cache is full and did not take a new entry.
    #[error("statement cache is full ({capacity} entries)")]
    CacheFull {
        /// Configured maximum number of entries
        capacity: usize,
    },
}

impl Error {
    /// Shortcut for an uncategorized driver error.
    pub fn driver(message: impl Into<String>) -> Self {
        Error::Driver(DriverError::unknown(message))
    }

    /// Returns the driver error if this failure came from the native driver.
    pub fn as_driver_error(&self) -> Option<&DriverError> {
        match self {
            Error::Driver(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true if the failure happened because something was already closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_) | Error::TransactionDone)
    }
}
