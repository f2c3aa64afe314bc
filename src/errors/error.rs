//! The gateway error type.

use std::time::Duration;
use thiserror::Error;

use crate::errors::classify::{classify, parse_retry_after, ErrorKind};

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Main error type for the gateway core.
///
/// Variants model where a failure originated; the policy-facing taxonomy is
/// derived from them via [`classify`]. Errors are `Clone` because a single
/// failure may be fanned out to every caller of a batch group or replayed
/// through retry bookkeeping.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Invalid configuration (bad builder input, unparseable environment)
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem
        message: String,
    },

    /// The remote API answered with a non-success response
    #[error("Upstream error: {message}")]
    Upstream {
        /// Error message surfaced by the remote API
        message: String,
        /// HTTP status code, when one was received
        status: Option<u16>,
    },

    /// Connection-level failure before any response arrived
    #[error("Network error: {message}")]
    Network {
        /// Description of the network failure
        message: String,
    },

    /// A unit of work exceeded its deadline
    #[error("Timeout: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Admission was denied, either locally or by the remote API
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Description of the limit that was hit
        message: String,
        /// Duration to wait before retrying, when the source provided one
        retry_after: Option<Duration>,
    },

    /// A queued request was rejected because the queue was explicitly cleared
    #[error("Queue cleared while request for '{operation}' was pending")]
    QueueCleared {
        /// Operation name the pending request carried
        operation: String,
    },

    /// Work was rejected because the gateway is shutting down
    #[error("Gateway shut down while request for '{operation}' was pending")]
    Shutdown {
        /// Operation name the rejected request carried
        operation: String,
    },

    /// Library bug or impossible state
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal failure
        message: String,
    },

    /// A failure that carries no recognizable signal
    #[error("Unknown error: {message}")]
    Unknown {
        /// Raw error message
        message: String,
    },
}

impl GatewayError {
    /// Classifies this error into the policy taxonomy.
    pub fn kind(&self) -> ErrorKind {
        classify(self)
    }

    /// Returns true if retrying can plausibly change the outcome.
    ///
    /// Delegates to [`ErrorKind::is_retryable_by_default`]; callers with a
    /// custom retryable set should consult [`GatewayError::kind`] directly.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable_by_default()
    }

    /// Returns the wait the source asked for before the next attempt.
    ///
    /// For rate-limit errors this is the explicit `retry_after` when present,
    /// otherwise a "retry after N seconds" hint parsed out of the message.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited {
                retry_after: Some(wait),
                ..
            } => Some(*wait),
            GatewayError::RateLimited { message, .. } => parse_retry_after(message),
            other if other.kind() == ErrorKind::RateLimited => {
                parse_retry_after(&other.to_string())
            }
            _ => None,
        }
    }
}

// Conversions from common error types
impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout {
                message: format!("Request timed out: {}", err),
            }
        } else if err.is_connect() {
            GatewayError::Network {
                message: format!("Connection failed: {}", err),
            }
        } else if let Some(status) = err.status() {
            GatewayError::Upstream {
                message: err.to_string(),
                status: Some(status.as_u16()),
            }
        } else {
            GatewayError::Network {
                message: format!("Transport error: {}", err),
            }
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal {
            message: format!("JSON serialization/deserialization error: {}", err),
        }
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GatewayError::Timeout {
            message: "Deadline elapsed before the work completed".to_string(),
        }
    }
}
