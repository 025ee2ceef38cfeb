use thiserror::Error;

/// Errors that cross the public boundary of the core.
///
/// Connectivity loss, timeouts, parse failures and background-gated calls
/// are not represented here; those surface as status flags or empty results.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid query: {message}")]
    InvalidQuery { message: String },
    #[error("Storage error: {message}")]
    Storage { message: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a raw event could not become a cached record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unexpected kind {found}, expected {expected}")]
    WrongKind { expected: u16, found: u16 },
    #[error("missing required tag '{0}'")]
    MissingField(&'static str),
    #[error("invalid value '{value}' for tag '{field}'")]
    InvalidField { field: &'static str, value: String },
}

/// Failures reported by a relay transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("connection to {url} failed: {message}")]
    Connection { url: String, message: String },
    #[error("relay {0} is not connected")]
    NotConnected(String),
    #[error("transport error: {0}")]
    Other(String),
}
