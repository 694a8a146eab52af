//! Error types for the query cache engine.

use crate::key::QueryHash;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Cancellation of an attempt sequence.
///
/// `revert` restores the state captured before the fetch started, `silent` keeps the
/// cancellation from surfacing as an error. The two flags are independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelledError {
    pub revert: bool,
    pub silent: bool,
}

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CancelledError")
    }
}

impl std::error::Error for CancelledError {}

/// Errors produced while fetching or mutating.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// Whatever the query or mutation function failed with, unchanged.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),

    #[error("{0}")]
    Cancelled(CancelledError),

    #[error("Missing query function: '{query_hash}'")]
    MissingQueryFn { query_hash: QueryHash },

    #[error("No mutation function found")]
    MissingMutationFn,

    /// The function resolved with a value the cache cannot hold.
    #[error("Query data cannot be undefined: {query_hash} ({reason})")]
    InvalidData { query_hash: QueryHash, reason: String },

    #[error("Failed to decode cached data: {0}")]
    Decode(String),

    /// An error restored from a dehydrated snapshot; only its message survives transfer.
    #[error("{0}")]
    Hydrated(String),
}

impl QueryError {
    /// Wrap any error as a user failure.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        QueryError::Failed(Arc::new(error.into()))
    }

    /// Build a user failure from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        QueryError::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled(_))
    }

    pub fn cancelled(&self) -> Option<CancelledError> {
        match self {
            QueryError::Cancelled(c) => Some(*c),
            _ => None,
        }
    }

    /// Downcast a user failure back to its concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            QueryError::Failed(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for QueryError {
    fn from(err: anyhow::Error) -> Self {
        QueryError::Failed(Arc::new(err))
    }
}

impl From<CancelledError> for QueryError {
    fn from(err: CancelledError) -> Self {
        QueryError::Cancelled(err)
    }
}

/// Errors raised while setting up a client: configuration and logging.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::ConfigError(err.to_string())
    }
}
