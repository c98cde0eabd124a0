//! Telemetry sink capability and cache metrics.
//!
//! Two compound metrics are recorded per connection:
//! - `<namespace>.cache.time`: operation latency in milliseconds, tagged
//!   with `result:success|fail`
//! - `<namespace>.cache.result`: a count of 1 per successful get, tagged
//!   with `result:hit|miss`
//!
//! Both carry `method`, `cache` and `server` tags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Destination for compound metrics.
pub trait TelemetrySink: Send + Sync {
    /// Record `value` for metric `name` with `key:value` tags.
    fn record_compound_metric(&self, name: &str, value: f64, tags: &[String]);

    /// Release any resources held by the sink.
    fn stop(&self) {}
}

/// Sink that logs each metric as a structured tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record_compound_metric(&self, name: &str, value: f64, tags: &[String]) {
        debug!(metric = name, value, tags = ?tags, "Cache metric");
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record_compound_metric(&self, _name: &str, _value: f64, _tags: &[String]) {}
}

/// A single recorded metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    pub tags: Vec<String>,
}

impl MetricRecord {
    /// Whether the record carries the exact tag `tag` (e.g. `"result:hit"`).
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Sink that keeps every metric in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<MetricRecord>>,
    stopped: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<MetricRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records for metric `name`.
    pub fn named(&self, name: &str) -> Vec<MetricRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.name == name)
            .collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl TelemetrySink for MemorySink {
    fn record_compound_metric(&self, name: &str, value: f64, tags: &[String]) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MetricRecord {
                name: name.to_string(),
                value,
                tags: tags.to_vec(),
            });
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Cache operation, as reported in the `method` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Set,
    Remove,
    Expire,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Set => "set",
            Method::Remove => "remove",
            Method::Expire => "expire",
        }
    }
}

/// Per-connection metric recorder.
pub(crate) struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
    time_metric: String,
    result_metric: String,
    cache: String,
}

impl Telemetry {
    pub(crate) fn new(sink: Arc<dyn TelemetrySink>, namespace: &str, cache: &str) -> Self {
        Self {
            sink,
            time_metric: format!("{}.cache.time", namespace),
            result_metric: format!("{}.cache.result", namespace),
            cache: cache.to_string(),
        }
    }

    /// Record how long an operation took and whether it succeeded.
    pub(crate) fn timing(&self, method: Method, success: bool, elapsed: Duration, server: &str) {
        let result = if success { "success" } else { "fail" };
        self.sink.record_compound_metric(
            &self.time_metric,
            elapsed.as_secs_f64() * 1000.0,
            &self.tags(result, method, server),
        );
    }

    /// Record a hit or miss for a successful lookup.
    pub(crate) fn lookup(&self, method: Method, hit: bool, server: &str) {
        let result = if hit { "hit" } else { "miss" };
        self.sink
            .record_compound_metric(&self.result_metric, 1.0, &self.tags(result, method, server));
    }

    pub(crate) fn stop(&self) {
        self.sink.stop();
    }

    fn tags(&self, result: &str, method: Method, server: &str) -> Vec<String> {
        vec![
            format!("result:{}", result),
            format!("method:{}", method.as_str()),
            format!("cache:{}", self.cache),
            format!("server:{}", server),
        ]
    }
}
