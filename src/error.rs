//! Errors surfaced to callers of the cache client.
//!
//! Every operation resolves to exactly one of these; none of them panic
//! or escape as anything other than an `Err`.

use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors returned by [`CacheClient`](crate::client::CacheClient) operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The connection is not ready; no request was sent.
    #[error("the client is not ready")]
    NotReady,

    /// The transport did not answer within the configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The transport reported a failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The key cannot be sent over the memcached protocol.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The value could not be encoded to, or decoded from, JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Whether this failure should make the owning connection reconnect.
    ///
    /// Only failures of a live transport call qualify. `NotReady` never
    /// does since a reconnect may already be under way.
    pub fn triggers_reconnect(&self) -> bool {
        matches!(self, CacheError::Timeout(_) | CacheError::Transport(_))
    }
}
