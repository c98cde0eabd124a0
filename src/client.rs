//! Guarded cache operations.
//!
//! Every operation on [`CacheClient`] follows the same contract:
//! - The key is validated before anything else
//! - The connection must be `READY`, otherwise `NotReady` is returned and
//!   nothing is sent
//! - The transport call is bounded by the client timeout
//! - One timing metric is recorded per call that reached the transport
//! - Timeouts and transport errors make the connection reconnect; the
//!   caller gets the error without waiting for the reconnect
//!
//! Values are stored as JSON.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::ClientOptions;
use crate::connection::{Connection, Readiness};
use crate::error::{CacheError, CacheResult};
use crate::fuse::Fuse;
use crate::protocol;
use crate::telemetry::{Method, TelemetrySink, TracingSink};
use crate::transport::{EventKind, MemcachedFactory, Transport, TransportEvent, TransportFactory, TransportResult};

/// Resilient client for one cache server.
pub struct CacheClient<F: TransportFactory = MemcachedFactory> {
    connection: Connection<F>,
    fuse: Fuse,
}

impl CacheClient<MemcachedFactory> {
    /// Connect to a memcached server. Must be called within a Tokio runtime.
    pub fn new(options: ClientOptions) -> Self {
        Self::with_factory(options, MemcachedFactory)
    }
}

impl<F: TransportFactory> CacheClient<F> {
    /// Use a custom transport, reporting metrics through tracing.
    pub fn with_factory(options: ClientOptions, factory: F) -> Self {
        Self::with_sink(options, factory, Arc::new(TracingSink))
    }

    pub fn with_sink(options: ClientOptions, factory: F, sink: Arc<dyn TelemetrySink>) -> Self {
        let fuse = Fuse::new(options.timeout());
        Self {
            connection: Connection::open(options, factory, sink),
            fuse,
        }
    }

    /// Fetch and decode a value. A miss is `Ok(None)`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let (payload, server) = self
            .guarded(Method::Get, key, |transport| async move { transport.get(key).await })
            .await?;

        let payload = payload.filter(|bytes| !bytes.is_empty());
        self.connection
            .telemetry()
            .lookup(Method::Get, payload.is_some(), &server);

        match payload {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store a value that never expires.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CacheResult<()> {
        self.set_with_ttl(key, value, 0).await
    }

    /// Store a value expiring after `ttl` seconds (0 = never).
    pub async fn set_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: u32,
    ) -> CacheResult<()> {
        let payload = Bytes::from(serde_json::to_vec(value)?);
        self.guarded(Method::Set, key, |transport| async move {
            transport.set(key, payload, ttl).await
        })
        .await?;
        Ok(())
    }

    /// Delete a key. Deleting an absent key succeeds.
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let (existed, _) = self
            .guarded(Method::Remove, key, |transport| async move {
                transport.delete(key).await
            })
            .await?;
        debug!(key, existed, "Deleted");
        Ok(())
    }

    /// Alias of [`delete`](Self::delete).
    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        self.delete(key).await
    }

    /// Replace a key's expiration. Returns whether the key existed.
    pub async fn expire(&self, key: &str, ttl: u32) -> CacheResult<bool> {
        let (existed, _) = self
            .guarded(Method::Expire, key, |transport| async move {
                transport.touch(key, ttl).await
            })
            .await?;
        Ok(existed)
    }

    /// See [`Connection::on`].
    pub fn on<L>(&self, kind: EventKind, listener: L)
    where
        L: Fn(&TransportEvent, &str) + Send + Sync + 'static,
    {
        self.connection.on(kind, listener);
    }

    pub fn reconnect(&self) -> bool {
        self.connection.reconnect()
    }

    pub fn quit(&self) {
        self.connection.quit();
    }

    pub async fn wait_ready(&self, limit: Duration) -> CacheResult<()> {
        self.connection.wait_ready(limit).await
    }

    pub fn readiness(&self) -> Readiness {
        self.connection.readiness()
    }

    pub fn connection(&self) -> &Connection<F> {
        &self.connection
    }

    /// Run one transport call under the readiness gate and the fuse.
    ///
    /// Returns the transport's result with the server name it ran against.
    async fn guarded<R, Op, Fut>(&self, method: Method, key: &str, op: Op) -> CacheResult<(R, String)>
    where
        Op: FnOnce(Arc<F::Transport>) -> Fut,
        Fut: Future<Output = TransportResult<R>>,
    {
        protocol::validate_key(key).map_err(CacheError::InvalidKey)?;

        let Some((transport, server)) = self.connection.acquire() else {
            debug!(method = method.as_str(), key, "Rejected, connection not ready");
            return Err(CacheError::NotReady);
        };

        let start = Instant::now();
        let outcome = match self.fuse.run(op(transport)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CacheError::Transport(e)),
            Err(blown) => Err(CacheError::Timeout(blown.limit())),
        };
        let elapsed = start.elapsed();

        self.connection
            .telemetry()
            .timing(method, outcome.is_ok(), elapsed, &server);

        match outcome {
            Ok(value) => {
                debug!(method = method.as_str(), key, server = %server, ?elapsed, "Cache operation succeeded");
                Ok((value, server))
            }
            Err(e) => {
                warn!(method = method.as_str(), key, server = %server, error = %e, "Cache operation failed");
                if e.triggers_reconnect() {
                    self.connection.reconnect();
                }
                Err(e)
            }
        }
    }
}
