//! Error types for the authenticating pool.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by the pool and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The connection URL is malformed or its host carries no region label.
    #[error("invalid connection url: {0}")]
    UrlParse(String),

    /// The root certificate is missing or cannot be parsed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The trust store could not be written, read, or verified.
    #[error("trust store error: {0}")]
    KeyStore(String),

    /// Token generation failed (missing credentials or signing failure).
    #[error("authentication token error: {0}")]
    Auth(String),

    /// First-time initialization failed. Every later call returns the same cause.
    #[error("pool initialization failed: {0}")]
    Init(#[source] Arc<PoolError>),

    /// The underlying pool failed for a reason unrelated to authentication.
    #[error("connection error: {0}")]
    Connection(String),

    /// Settings were rejected before the pool was built.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The pool has been closed.
    #[error("pool closed")]
    Closed,
}

impl PoolError {
    /// Wrap an initialization failure so it can be replayed to later callers.
    pub fn init(cause: PoolError) -> Self {
        match cause {
            PoolError::Init(_) => cause,
            other => PoolError::Init(Arc::new(other)),
        }
    }

    /// The root cause when this is an initialization failure.
    pub fn init_cause(&self) -> Option<&PoolError> {
        match self {
            PoolError::Init(cause) => Some(cause),
            _ => None,
        }
    }
}
