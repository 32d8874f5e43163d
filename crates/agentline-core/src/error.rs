//! Error types shared across the query pipeline

use thiserror::Error;

/// Failures surfaced by the runtime bridge to its consumer
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Body ended early before enough frames arrived to trust the partial stream
    #[error("runtime stream truncated after {frames} frames")]
    Truncated { frames: usize },
    #[error("runtime invocation failed: {0}")]
    Upstream(String),
    #[error("runtime stream read failed: {0}")]
    Io(#[from] std::io::Error),
    /// Worker thread exited without signalling end of stream
    #[error("runtime worker stopped unexpectedly")]
    WorkerLost,
}

/// Errors from the external runtime client
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("runtime returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid runtime endpoint: {0}")]
    Endpoint(String),
}

/// Terminal failures of a single query
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("No permission to access resources: {0}")]
    Unauthorized(String),
    #[error("Concurrent query limit reached ({limit} active queries), please wait for one to finish")]
    QuotaExceeded { limit: usize },
    #[error("Failed to load account information: {0}")]
    AccountLookup(String),
    #[error("Query failed: {0}")]
    Bridge(#[from] BridgeError),
}
