//! Connection manager for one cache server.
//!
//! A [`Connection`] owns exactly one transport handle at a time and tracks
//! whether that handle can serve requests:
//!
//! ```text
//! CONNECTING --(ready event + handle installed)--> READY
//! READY --(reconnect / failure event)--> CONNECTING
//! ```
//!
//! Every handle is opened with an event emitter tagged with a generation
//! number. Replacing the handle bumps the generation, so events that a
//! retired handle reports late are ignored. Reconnecting while already
//! `CONNECTING` is a no-op, which collapses a burst of concurrent failures
//! into a single new handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ClientOptions, UNKNOWN_SERVER};
use crate::error::{CacheError, CacheResult};
use crate::fuse::Fuse;
use crate::telemetry::{Telemetry, TelemetrySink};
use crate::transport::{EventEmitter, EventKind, MemcachedFactory, Transport, TransportEvent, TransportFactory};

/// Whether the connection can currently serve requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A handle is being opened or has not confirmed readiness yet.
    Connecting,
    /// The active handle confirmed readiness.
    Ready,
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Connecting => f.write_str("connecting"),
            Readiness::Ready => f.write_str("ready"),
        }
    }
}

type Listener = Arc<dyn Fn(&TransportEvent, &str) + Send + Sync>;

/// Mutable connection state, always read and written under one lock.
struct Slot<T> {
    readiness: Readiness,
    generation: u64,
    /// Set once the current generation reported `Ready`.
    confirmed: bool,
    transport: Option<Arc<T>>,
    server_name: String,
}

struct Inner<F: TransportFactory> {
    options: ClientOptions,
    factory: F,
    slot: Mutex<Slot<F::Transport>>,
    listeners: RwLock<Vec<(EventKind, Listener)>>,
    closed: AtomicBool,
    /// Mirrors `readiness == Ready` for waiters.
    serving: watch::Sender<bool>,
    telemetry: Telemetry,
}

/// One logical connection to one cache server.
///
/// Cloning is cheap and every clone shares the same state.
pub struct Connection<F: TransportFactory = MemcachedFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: TransportFactory> Clone for Connection<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: TransportFactory> Connection<F> {
    /// Build a connection and open its first transport handle.
    ///
    /// Returns immediately in `CONNECTING`; dial results arrive as events.
    pub fn open(options: ClientOptions, factory: F, sink: Arc<dyn TelemetrySink>) -> Self {
        let telemetry = Telemetry::new(sink, &options.metrics_namespace, &options.name);
        let (serving, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            options,
            factory,
            slot: Mutex::new(Slot {
                readiness: Readiness::Connecting,
                generation: 0,
                confirmed: false,
                transport: None,
                server_name: UNKNOWN_SERVER.to_string(),
            }),
            listeners: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            serving,
            telemetry,
        });

        let connection = Self { inner };
        connection.connect();
        connection
    }

    /// Replace the transport handle unconditionally.
    pub fn connect(&self) {
        self.inner.replace(false);
    }

    /// Replace the transport handle unless a replacement is already under way.
    ///
    /// Returns whether a new handle was opened.
    pub fn reconnect(&self) -> bool {
        self.inner.replace(true)
    }

    /// Close the active handle and release telemetry resources.
    ///
    /// Operations fail with `NotReady` afterwards and reconnects are ignored.
    pub fn quit(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let transport = {
            let mut slot = self.inner.lock_slot();
            slot.readiness = Readiness::Connecting;
            slot.confirmed = false;
            slot.transport.take()
        };
        self.inner.serving.send_replace(false);

        if let Some(transport) = transport {
            transport.end();
        }
        self.inner.telemetry.stop();
        info!(cache = %self.inner.options.name, "Connection closed");
    }

    /// Register a listener for transport events of `kind`.
    ///
    /// The listener receives the event and the server name. Listeners stay
    /// registered across reconnects.
    pub fn on<L>(&self, kind: EventKind, listener: L)
    where
        L: Fn(&TransportEvent, &str) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, Arc::new(listener)));
    }

    pub fn readiness(&self) -> Readiness {
        self.inner.lock_slot().readiness
    }

    /// `"unknown"` until the first handle reports ready, then `host:port`
    pub fn server_name(&self) -> String {
        self.inner.lock_slot().server_name.clone()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait until the connection is `READY`, for at most `limit`.
    pub async fn wait_ready(&self, limit: Duration) -> CacheResult<()> {
        if self.is_closed() {
            return Err(CacheError::NotReady);
        }

        // `quit` publishes through the same channel, so parked waiters wake up
        let closed = &self.inner.closed;
        let mut serving = self.inner.serving.subscribe();
        let waited = Fuse::new(limit)
            .run(async move {
                let served = serving
                    .wait_for(|ready| *ready || closed.load(Ordering::SeqCst))
                    .await
                    .is_ok();
                served
            })
            .await;

        match waited {
            Ok(true) if !self.is_closed() => Ok(()),
            Ok(_) => Err(CacheError::NotReady),
            Err(blown) => Err(CacheError::Timeout(blown.limit())),
        }
    }

    /// The active handle and server name, only while `READY`.
    pub(crate) fn acquire(&self) -> Option<(Arc<F::Transport>, String)> {
        let slot = self.inner.lock_slot();
        match (&slot.readiness, &slot.transport) {
            (Readiness::Ready, Some(transport)) => {
                Some((Arc::clone(transport), slot.server_name.clone()))
            }
            _ => None,
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.inner.telemetry
    }
}

impl<F: TransportFactory> Inner<F> {
    fn lock_slot(&self) -> MutexGuard<'_, Slot<F::Transport>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Retire the current handle and open a new one.
    ///
    /// With `guarded`, nothing happens while already `CONNECTING`.
    fn replace(self: &Arc<Self>, guarded: bool) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        let (generation, retired) = {
            let mut slot = self.lock_slot();
            if guarded && slot.readiness == Readiness::Connecting {
                debug!(cache = %self.options.name, "Reconnect already in progress");
                return false;
            }
            slot.readiness = Readiness::Connecting;
            slot.confirmed = false;
            slot.generation += 1;
            (slot.generation, slot.transport.take())
        };
        self.serving.send_replace(false);

        if let Some(retired) = retired {
            info!(cache = %self.options.name, generation, "Reconnecting");
            retired.end();
        } else {
            info!(
                cache = %self.options.name,
                server = %self.options.address(),
                "Connecting"
            );
        }

        // Opening may report Ready synchronously, before the handle is installed
        let transport = Arc::new(self.factory.open(&self.options, self.emitter(generation)));
        self.install(generation, transport);
        true
    }

    fn install(&self, generation: u64, transport: Arc<F::Transport>) {
        let stale = {
            let mut slot = self.lock_slot();
            if slot.generation != generation || self.closed.load(Ordering::SeqCst) {
                Some(transport)
            } else {
                slot.transport = Some(transport);
                if slot.confirmed {
                    slot.readiness = Readiness::Ready;
                }
                self.serving.send_replace(slot.readiness == Readiness::Ready);
                None
            }
        };

        // Superseded while it was being opened
        if let Some(stale) = stale {
            stale.end();
        }
    }

    fn emitter(self: &Arc<Self>, generation: u64) -> EventEmitter {
        let inner: Weak<Self> = Arc::downgrade(self);
        EventEmitter::new(move |event| {
            if let Some(inner) = inner.upgrade() {
                inner.handle_event(generation, event);
            }
        })
    }

    fn handle_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        let server_name = {
            let mut slot = self.lock_slot();
            if slot.generation != generation {
                debug!(event = %event.kind(), generation, "Ignoring event from retired transport");
                return;
            }

            if event == TransportEvent::Ready && !self.closed.load(Ordering::SeqCst) {
                slot.confirmed = true;
                slot.server_name = self.options.address();
                if slot.transport.is_some() {
                    slot.readiness = Readiness::Ready;
                    self.serving.send_replace(true);
                }
                info!(server = %slot.server_name, cache = %self.options.name, "Connection ready");
            }
            slot.server_name.clone()
        };

        self.notify(&event, &server_name);

        match &event {
            TransportEvent::Failure { reason } | TransportEvent::Error { reason } => {
                warn!(server = %server_name, reason = %reason, event = %event.kind(), "Transport reported a failure");
                self.replace(true);
            }
            _ => {}
        }
    }

    fn notify(&self, event: &TransportEvent, server_name: &str) {
        // Cloned out so a listener may register listeners or reconnect
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(kind, _)| *kind == event.kind())
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(event, server_name);
        }
    }
}

impl<F: TransportFactory> Drop for Inner<F> {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(transport) = slot.transport.take() {
            transport.end();
        }
    }
}
