//! Error taxonomy for the protocol library.
//!
//! Transport-class errors are retryable at the bus-client level; protocol
//! and timeout errors are not.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CzError {
    /// Caller handed us something unbuildable (oversized payload, bad endpoint).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Endpoint could not be reached or opened.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// I/O failure on an established connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Peer stopped talking (EOF or too many empty reads).
    #[error("connection aborted: {0}")]
    ConnectionAborted(String),

    /// Malformed or negative reply from the controller.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No valid reply within the scan/deadline budget.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl CzError {
    /// Whether the bus client's retry policy applies.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CzError::Unreachable(_) | CzError::Transport(_) | CzError::ConnectionAborted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CzError>;
