//! Error types for KivIO
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for KivIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for KivIO
#[derive(Debug, Error)]
pub enum Error {
    // Data errors
    #[error("key not found")]
    KeyNotFound,

    #[error("key already exists: {0}")]
    KeyDuplicate(String),

    // Cluster errors
    #[error("not the leader{}", leader_suffix(.0))]
    NotLeader(Option<String>),

    #[error("no {0} endpoints available")]
    Unavailable(&'static str),

    #[error("failed to join cluster via {0} peer(s)")]
    JoinRefused(usize),

    // Network/RPC errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("unexpected response from {url}: status {status}")]
    UnexpectedResponse { url: String, status: u16 },

    // Metadata store errors
    #[error("metadata store error: {0}")]
    MetaStore(String),

    // Local store errors
    #[error("storage error: {0}")]
    Storage(String),

    // Request/internal errors
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn leader_suffix(leader: &Option<String>) -> String {
    match leader {
        Some(addr) => format!(", leader is {addr}"),
        None => String::new(),
    }
}

impl Error {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a metadata store error
    pub fn meta(msg: impl Into<String>) -> Self {
        Self::MetaStore(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid params error
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    /// Check if this is an authoritative not-found answer
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound)
    }

    /// Check if this error means "endpoint is slow or down": the caller
    /// should clear its fast hint and fall back to fan-out.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ConnectionFailed(_)
                | Self::NotLeader(_)
                | Self::UnexpectedResponse { .. }
        )
    }

    /// Leader hint carried by a NotLeader redirect, if any
    #[must_use]
    pub fn leader_hint(&self) -> Option<&str> {
        match self {
            Self::NotLeader(Some(addr)) => Some(addr),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::ConnectionFailed(err.to_string())
        }
    }
}
