//! Delivery errors

/// Failure to hand a result to a reporting endpoint
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Collector rejected events ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Cannot determine host identity: {0}")]
    Identity(String),

    #[error("All {attempted} collectors failed, last error: {last}")]
    AllServersFailed { attempted: usize, last: String },
}

impl From<TransportError> for trubble_core::Error {
    fn from(err: TransportError) -> Self {
        trubble_core::Error::Transport(err.to_string())
    }
}
