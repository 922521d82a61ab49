//! Common error types for ipstats

use thiserror::Error;

/// Common result type for ipstats operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across ipstats crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Scope hierarchy rejected during validation
    #[error("Invalid scope configuration: {0}")]
    Validation(#[from] ValidationError),

    /// Observation export could not be read
    #[error("Export error: {0}")]
    Export(String),

    /// Invalid user input or parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Export(err.to_string())
    }
}

/// Reasons a configured place list is not a usable scope hierarchy
///
/// Always fatal: raised before any classification work starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no places configured; the list must end with the global scope")]
    Empty,

    #[error("last place must be the global scope, found '{0}'")]
    GlobalNotLast(String),

    #[error("global scope may only appear once, as the last place (position {0})")]
    GlobalNotTerminal(usize),

    #[error("place '{key}' has a negative threshold ({threshold})")]
    NegativeThreshold { key: String, threshold: i64 },

    #[error("place '{0}' lists no place ids")]
    EmptyPlaceIds(String),

    #[error("duplicate place identifier '{0}'")]
    DuplicateIdentifier(String),

    #[error("duplicate place key '{0}'")]
    DuplicateKey(String),
}
