//! Scriptable transport for connection and client tests.
//!
//! Every handle opened by a [`MockFactory`] shares one [`MockState`], so a
//! test keeps a clone of the factory and inspects or steers the handles the
//! connection builds behind its back.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{EventEmitter, MemoryStore, Transport, TransportError, TransportEvent, TransportFactory, TransportResult};
use crate::config::ClientOptions;
use crate::fuse;

#[derive(Default)]
pub(crate) struct MockState {
    opened: AtomicUsize,
    ended: AtomicUsize,
    calls: AtomicUsize,
    late_replies: AtomicUsize,
    auto_ready: AtomicBool,
    delay: Mutex<Duration>,
    fail_with: Mutex<Option<String>>,
    last_ttl: Mutex<Option<u32>>,
    emitters: Mutex<Vec<EventEmitter>>,
    store: Arc<MemoryStore>,
}

#[derive(Clone)]
pub(crate) struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    /// Handles report `Ready` as soon as they are opened
    pub(crate) fn new() -> Self {
        let factory = Self::manual();
        factory.state.auto_ready.store(true, Ordering::SeqCst);
        factory
    }

    /// Handles stay silent until the test emits events itself
    pub(crate) fn manual() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }

    pub(crate) fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn ended(&self) -> usize {
        self.state.ended.load(Ordering::SeqCst)
    }

    /// Raw operations that reached a transport
    pub(crate) fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Replies produced after their caller stopped waiting
    pub(crate) fn late_replies(&self) -> usize {
        self.state.late_replies.load(Ordering::SeqCst)
    }

    pub(crate) fn last_ttl(&self) -> Option<u32> {
        *lock(&self.state.last_ttl)
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *lock(&self.state.delay) = delay;
    }

    /// Make every operation fail with a server error
    pub(crate) fn fail_with(&self, reason: &str) {
        *lock(&self.state.fail_with) = Some(reason.to_string());
    }

    pub(crate) fn store(&self) -> &Arc<MemoryStore> {
        &self.state.store
    }

    /// Emit `event` from the most recently opened handle
    pub(crate) fn emit_latest(&self, event: TransportEvent) {
        let emitter = lock(&self.state.emitters).last().cloned();
        if let Some(emitter) = emitter {
            emitter.emit(event);
        }
    }

    /// Emit `event` from the handle opened `index`-th (0-based)
    pub(crate) fn emit_from(&self, index: usize, event: TransportEvent) {
        let emitter = lock(&self.state.emitters).get(index).cloned();
        if let Some(emitter) = emitter {
            emitter.emit(event);
        }
    }
}

impl TransportFactory for MockFactory {
    type Transport = MockTransport;

    fn open(&self, _options: &ClientOptions, events: EventEmitter) -> MockTransport {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.emitters).push(events.clone());
        if self.state.auto_ready.load(Ordering::SeqCst) {
            events.emit(TransportEvent::Ready);
        }
        MockTransport {
            state: Arc::clone(&self.state),
            events,
        }
    }
}

pub(crate) struct MockTransport {
    state: Arc<MockState>,
    events: EventEmitter,
}

impl MockTransport {
    /// Apply the scripted failure, then hand `outcome` back after the
    /// scripted delay through a single-fire completion
    async fn respond<T: Send + 'static>(&self, outcome: TransportResult<T>) -> TransportResult<T> {
        let failure = lock(&self.state.fail_with).clone();
        let outcome = match failure {
            Some(reason) => Err(TransportError::Server(reason)),
            None => outcome,
        };

        let delay = *lock(&self.state.delay);
        if delay.is_zero() {
            return outcome;
        }

        let (completion, pending) = fuse::completion();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !completion.complete(outcome) {
                state.late_replies.fetch_add(1, Ordering::SeqCst);
            }
        });
        pending.wait().await.unwrap_or(Err(TransportError::Closed))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, key: &str) -> TransportResult<Option<Bytes>> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let found = self.state.store.get(key);
        self.respond(Ok(found)).await
    }

    async fn set(&self, key: &str, payload: Bytes, ttl: u32) -> TransportResult<()> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state.last_ttl) = Some(ttl);
        self.state.store.set(key, payload, ttl);
        self.respond(Ok(())).await
    }

    async fn delete(&self, key: &str) -> TransportResult<bool> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let existed = self.state.store.delete(key);
        self.respond(Ok(existed)).await
    }

    async fn touch(&self, key: &str, ttl: u32) -> TransportResult<bool> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state.last_ttl) = Some(ttl);
        let existed = self.state.store.touch(key, ttl);
        self.respond(Ok(existed)).await
    }

    fn end(&self) {
        self.state.ended.fetch_add(1, Ordering::SeqCst);
        self.events.emit(TransportEvent::Remove);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
