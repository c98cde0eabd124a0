//! In-process transport backed by a shared map.
//!
//! Provides the memcached storage semantics the client relies on:
//! - Payloads are opaque bytes
//! - ttl 0 never expires, otherwise relative seconds
//! - Expired items read as missing and are removed lazily on access
//!
//! Handles opened from the same [`MemoryFactory`] share one store, so data
//! survives reconnects just as it would on a real server.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::trace;

use super::{EventEmitter, Transport, TransportError, TransportEvent, TransportFactory, TransportResult};
use crate::config::ClientOptions;

/// A single stored item
#[derive(Debug, Clone)]
struct StoredItem {
    payload: Bytes,
    /// Absolute expiration time (None = never expires)
    expires_at: Option<Instant>,
}

impl StoredItem {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(expires_at) if Instant::now() >= expires_at)
    }
}

/// Thread-safe store shared by memory transports
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, StoredItem>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Calculate expiration time from TTL
    fn expiry(ttl: u32) -> Option<Instant> {
        if ttl == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_secs(u64::from(ttl)))
        }
    }

    /// Get a payload
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        match data.get(key) {
            Some(item) if item.is_expired() => {
                trace!(key, "Item expired on access");
                drop(data);
                self.delete(key);
                None
            }
            Some(item) => Some(item.payload.clone()),
            None => None,
        }
    }

    /// Store a payload
    pub fn set(&self, key: &str, payload: Bytes, ttl: u32) {
        let item = StoredItem {
            payload,
            expires_at: Self::expiry(ttl),
        };
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), item);
        trace!(key, ttl, "Item stored");
    }

    /// Delete an item. Returns whether a live item was removed.
    pub fn delete(&self, key: &str) -> bool {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        match data.remove(key) {
            Some(item) => !item.is_expired(),
            None => false,
        }
    }

    /// Replace an item's expiration. Returns whether the item exists.
    pub fn touch(&self, key: &str, ttl: u32) -> bool {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        match data.get_mut(key) {
            Some(item) if item.is_expired() => {
                data.remove(key);
                false
            }
            Some(item) => {
                item.expires_at = Self::expiry(ttl);
                true
            }
            None => false,
        }
    }

    /// Number of stored items, including expired ones not yet removed
    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens [`MemoryTransport`]s over one shared store
#[derive(Debug, Clone, Default)]
pub struct MemoryFactory {
    store: Arc<MemoryStore>,
}

impl MemoryFactory {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

impl TransportFactory for MemoryFactory {
    type Transport = MemoryTransport;

    fn open(&self, _options: &ClientOptions, events: EventEmitter) -> MemoryTransport {
        // Nothing to dial: the store is reachable as soon as the handle exists
        events.emit(TransportEvent::Ready);
        MemoryTransport {
            store: Arc::clone(&self.store),
            events,
            ended: AtomicBool::new(false),
        }
    }
}

/// Transport handle over a [`MemoryStore`]
#[derive(Debug)]
pub struct MemoryTransport {
    store: Arc<MemoryStore>,
    events: EventEmitter,
    ended: AtomicBool,
}

impl MemoryTransport {
    fn check_open(&self) -> TransportResult<()> {
        if self.ended.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn get(&self, key: &str) -> TransportResult<Option<Bytes>> {
        self.check_open()?;
        Ok(self.store.get(key))
    }

    async fn set(&self, key: &str, payload: Bytes, ttl: u32) -> TransportResult<()> {
        self.check_open()?;
        self.store.set(key, payload, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> TransportResult<bool> {
        self.check_open()?;
        Ok(self.store.delete(key))
    }

    async fn touch(&self, key: &str, ttl: u32) -> TransportResult<bool> {
        self.check_open()?;
        Ok(self.store.touch(key, ttl))
    }

    fn end(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.events.emit(TransportEvent::Remove);
        }
    }
}
