//! Model backend error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the model backend.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Backend unreachable or the connection failed mid-request.
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        source: reqwest::Error,
    },

    /// No response within the configured timeout.
    #[error("Request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    /// Backend answered with a non-2xx status.
    #[error("Backend returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    /// Backend answered but the body was not the expected shape.
    #[error("Unexpected response shape: {0}")]
    ResponseShape(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(reqwest::Error),

    /// The task running the query panicked.
    #[error("Query task failed: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

impl GatewayError {
    /// Whether the failure happened before a usable response arrived
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport { .. } | GatewayError::Timeout { .. } | GatewayError::Status { .. }
        )
    }
}
