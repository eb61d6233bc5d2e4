//! Normalized error types for the query engine.
//!
//! Adapter- and transport-specific failures are mapped to these unified
//! variants so the executor has a single place to classify a failure into a
//! terminal query state. Cancellation is its own variant, never detected by
//! matching on message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;

/// Unified error type for all engine operations.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Query execution error: {message}")]
    ExecutionError { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound { connection_id: u64 },

    #[error("Query not found: {query_id}")]
    QueryNotFound { query_id: u64 },

    #[error("Feature not supported: {message}")]
    NotSupported { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed { message: msg.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn connection_not_found(id: u64) -> Self {
        Self::ConnectionNotFound { connection_id: id }
    }

    pub fn query_not_found(id: u64) -> Self {
        Self::QueryNotFound { query_id: id }
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// The well-known abort marker. The executor routes these to `Cancelled`
    /// instead of `Failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
