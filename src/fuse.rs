//! Timeout fuse for outbound operations.
//!
//! A fuse races an operation against a maximum wait. Exactly one outcome
//! reaches the caller: the operation's own result, or [`Blown`] once the
//! limit passes. Blowing the fuse only abandons the caller's wait; work the
//! transport already accepted may still finish, and its result is dropped.
//!
//! Event-driven transports hand out a [`Completion`] per request and keep
//! the matching [`Pending`] on the caller side. `Completion::complete`
//! consumes the completion, so a reply can be delivered at most once, and
//! it reports whether anyone was still waiting for it.

use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;

/// Error returned when a fuse expires before the guarded future resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blown {
    limit: Duration,
}

impl Blown {
    /// The limit that was exceeded.
    pub fn limit(&self) -> Duration {
        self.limit
    }
}

impl std::fmt::Display for Blown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fuse blown after {:?}", self.limit)
    }
}

impl std::error::Error for Blown {}

/// A timeout bound applied to individual operations.
#[derive(Debug, Clone, Copy)]
pub struct Fuse {
    limit: Duration,
}

impl Fuse {
    /// Create a fuse that blows after `limit`.
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    /// The configured limit.
    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Run `operation`, giving up once the limit passes.
    ///
    /// The operation future is dropped when the fuse blows.
    pub async fn run<F: Future>(&self, operation: F) -> Result<F::Output, Blown> {
        tokio::time::timeout(self.limit, operation)
            .await
            .map_err(|_| Blown { limit: self.limit })
    }
}

/// Create a linked single-fire completion pair.
pub fn completion<T>() -> (Completion<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx }, Pending { rx })
}

/// Producer half: delivers one result to whoever is waiting.
#[derive(Debug)]
pub struct Completion<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Completion<T> {
    /// Deliver `value`.
    ///
    /// Returns `false` when the waiting side is gone (its fuse blew or it
    /// was dropped); the value is discarded in that case.
    pub fn complete(self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }

    /// Whether the waiting side has already given up.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half: resolves with the delivered value.
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Pending<T> {
    /// Wait for the value.
    ///
    /// Resolves to `None` if the completion was dropped without firing.
    pub async fn wait(self) -> Option<T> {
        self.rx.await.ok()
    }
}
