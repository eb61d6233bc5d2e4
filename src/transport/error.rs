//! Structured errors for the bridge transport.
//!
//! Every bridge call that fails with a non-success HTTP status surfaces a
//! `TransportError` carrying the numeric status and status text. Callers
//! classify 4xx as configuration errors and 5xx/network failures as
//! potentially transient. Framing corruption is never retryable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised by the bridge transport layer.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("bridge request failed with status {status}: {message}")]
pub struct TransportError {
    /// The HTTP status reported by the bridge (0 for network-level failures).
    pub status: u16,
    /// The status text or failure description.
    pub message: String,
    /// Trailer metadata attached by the server, if any.
    pub trailers: HashMap<String, String>,
    /// Set when the framing itself is suspect and the stream was dropped.
    pub fatal: bool,
}

impl TransportError {
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            trailers: HashMap::new(),
            fatal: false,
        }
    }

    /// A network-level failure before any HTTP status was received.
    pub fn network(message: impl Into<String>) -> Self {
        Self::with_status(0, message)
    }

    /// Framing corruption. The stream's read offset can no longer be trusted,
    /// so the caller must not retry the read.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            message: message.into(),
            trailers: HashMap::new(),
            fatal: true,
        }
    }

    pub fn with_trailers(mut self, trailers: HashMap<String, String>) -> Self {
        self.trailers = trailers;
        self
    }

    /// Whether a caller may reasonably retry the failed call.
    ///
    /// 4xx statuses point at the caller's own configuration; fatal framing
    /// errors invalidate the stream entirely. Everything else (5xx, network
    /// failures) is potentially transient.
    pub fn is_retryable(&self) -> bool {
        if self.fatal {
            return false;
        }
        !(400..500).contains(&self.status)
    }
}

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
