//! guarded-memcached: a resilient memcached client
//!
//! Application code gets get/set/delete/expire that survive a flaky server:
//! - Requests only go out while the connection is ready; otherwise they fail
//!   fast with [`CacheError::NotReady`]
//! - Every call is bounded by a timeout fuse
//! - Timeouts and transport errors trigger a single, deduplicated reconnect
//! - Timing and hit/miss metrics go to a pluggable [`TelemetrySink`]
//!
//! ```no_run
//! use guarded_memcached::{CacheClient, ClientOptions};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), guarded_memcached::CacheError> {
//! let client = CacheClient::new(ClientOptions::new("127.0.0.1", 11211));
//! client.wait_ready(Duration::from_secs(1)).await?;
//!
//! client.set_with_ttl("greeting", "hello", 60).await?;
//! let greeting: Option<String> = client.get("greeting").await?;
//! assert_eq!(greeting.as_deref(), Some("hello"));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fuse;
pub mod protocol;
pub mod telemetry;
pub mod transport;

pub use client::CacheClient;
pub use config::ClientOptions;
pub use connection::{Connection, Readiness};
pub use error::{CacheError, CacheResult};
pub use telemetry::{MemorySink, NoopSink, TelemetrySink, TracingSink};
pub use transport::{EventKind, Transport, TransportError, TransportEvent, TransportFactory};
