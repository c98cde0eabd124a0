//! Transport capability.
//!
//! A transport performs the raw cache operations against one server and
//! reports its lifecycle through [`TransportEvent`]s. The connection layer
//! depends only on the traits in this module.
//!
//! ## Implementations
//! - `memcached`: memcached text protocol over TCP
//! - `memory`: in-process store, no network

pub mod memcached;
pub mod memory;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ClientOptions;

pub use memcached::{MemcachedFactory, MemcachedTransport};
pub use memory::{MemoryFactory, MemoryStore, MemoryTransport};

/// Result type for raw transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures reported by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The handle was ended or lost its stream before answering.
    #[error("connection closed")]
    Closed,

    /// Not connected and offline queueing is disabled.
    #[error("not connected and offline queue is disabled")]
    Offline,

    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// The server answered with something the request did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Raw operations against a single cache server.
///
/// Payloads are opaque bytes; ttl is in seconds, 0 meaning no expiration.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fetch a key. `Ok(None)` on miss.
    async fn get(&self, key: &str) -> TransportResult<Option<Bytes>>;

    /// Store a payload.
    async fn set(&self, key: &str, payload: Bytes, ttl: u32) -> TransportResult<()>;

    /// Delete a key. Returns whether it existed; an absent key is not an error.
    async fn delete(&self, key: &str) -> TransportResult<bool>;

    /// Update a key's expiration. Returns whether it existed.
    async fn touch(&self, key: &str, ttl: u32) -> TransportResult<bool>;

    /// Close the handle. Requests still queued fail with `Closed`.
    fn end(&self);
}

/// Builds transport handles for a connection.
///
/// `open` must not fail synchronously: connection problems are reported
/// later through `events`.
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Transport;

    fn open(&self, options: &ClientOptions, events: EventEmitter) -> Self::Transport;
}

/// Lifecycle events a transport reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The server is reachable and can serve requests.
    Ready,
    /// A dial attempt failed or an established stream was lost.
    Failure { reason: String },
    /// The transport will dial again after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The handle has stopped and will not serve further requests.
    Remove,
    /// The stream is out of sync with the server.
    Error { reason: String },
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Ready => EventKind::Ready,
            TransportEvent::Failure { .. } => EventKind::Failure,
            TransportEvent::Reconnecting { .. } => EventKind::Reconnecting,
            TransportEvent::Remove => EventKind::Remove,
            TransportEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// Event names used when registering listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Failure,
    Reconnecting,
    Remove,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Ready => "ready",
            EventKind::Failure => "failure",
            EventKind::Reconnecting => "reconnecting",
            EventKind::Remove => "remove",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle a transport uses to report events to its owner.
///
/// Events are delivered synchronously on the emitting task.
#[derive(Clone)]
pub struct EventEmitter {
    handler: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl EventEmitter {
    pub fn new(handler: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// An emitter that drops every event.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.handler)(event)
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_event_kinds() {
        assert_eq!(TransportEvent::Ready.kind(), EventKind::Ready);
        assert_eq!(
            TransportEvent::Failure {
                reason: "refused".to_string()
            }
            .kind(),
            EventKind::Failure
        );
        assert_eq!(EventKind::Reconnecting.to_string(), "reconnecting");
        assert_eq!(EventKind::Remove.as_str(), "remove");
    }

    #[test]
    fn test_emitter_forwards_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let emitter = EventEmitter::new(move |event| sink.lock().unwrap().push(event));

        emitter.emit(TransportEvent::Ready);
        emitter.clone().emit(TransportEvent::Remove);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![TransportEvent::Ready, TransportEvent::Remove]
        );
    }
}
