//! Metric sinks.
//!
//! Drivers receive an `Arc<dyn MetricSink>` at construction; there is no
//! process-wide registry. Names follow the driver convention:
//! - `<driver>.permits-limit`, `<driver>.permits` (gauges)
//! - `<driver>.put`, `.get`, `.delete`, `.list`, `.transaction` (timings, ms)
//! - `<driver>.<verb>Failed`, `<driver>.5xx` (counters)

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

/// Destination for gauges, counters and timing samples.
pub trait MetricSink: Send + Sync + Debug {
    /// Set a gauge to `value`.
    fn set_gauge(&self, name: &str, value: f64);

    /// Add `value` to a counter.
    fn incr_counter(&self, name: &str, value: u64);

    /// Record a timing or size sample.
    fn add_sample(&self, name: &str, value: f64);

    /// Record the milliseconds elapsed since `start`.
    fn measure_since(&self, name: &str, start: Instant) {
        self.add_sample(name, start.elapsed().as_secs_f64() * 1000.0);
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn set_gauge(&self, _name: &str, _value: f64) {}
    fn incr_counter(&self, _name: &str, _value: u64) {}
    fn add_sample(&self, _name: &str, _value: f64) {}
}

/// Shared no-op sink.
pub fn noop_sink() -> Arc<dyn MetricSink> {
    Arc::new(NoopSink)
}

// ============================================================================
// In-memory sink
// ============================================================================

/// Sink that keeps every observation in memory.
///
/// Gauges retain their full history so tests can assert on sequences.
#[derive(Debug, Default)]
pub struct InmemSink {
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, Vec<f64>>>,
    samples: RwLock<HashMap<String, SampleData>>,
}

impl InmemSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter value.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    /// Last value set on a gauge.
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.read().get(name).and_then(|h| h.last().copied())
    }

    /// Every value set on a gauge, oldest first.
    pub fn gauge_history(&self, name: &str) -> Vec<f64> {
        self.gauges.read().get(name).cloned().unwrap_or_default()
    }

    /// Summary of samples recorded under `name`.
    pub fn samples(&self, name: &str) -> Option<SampleSnapshot> {
        self.samples.read().get(name).map(SampleData::snapshot)
    }

    /// Names of every metric that has been touched.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .counters
            .read()
            .keys()
            .chain(self.gauges.read().keys())
            .chain(self.samples.read().keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl MetricSink for InmemSink {
    fn set_gauge(&self, name: &str, value: f64) {
        self.gauges
            .write()
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    fn incr_counter(&self, name: &str, value: u64) {
        *self.counters.write().entry(name.to_string()).or_insert(0) += value;
    }

    fn add_sample(&self, name: &str, value: f64) {
        self.samples
            .write()
            .entry(name.to_string())
            .or_insert_with(SampleData::new)
            .observe(value);
    }
}

#[derive(Debug)]
struct SampleData {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl SampleData {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::MAX,
            max: f64::MIN,
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn snapshot(&self) -> SampleSnapshot {
        SampleSnapshot {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
        }
    }
}

/// Sample summary.
#[derive(Debug, Clone)]
pub struct SampleSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl SampleSnapshot {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

// ============================================================================
// Per-driver metric names
// ============================================================================

/// Verb timed by [`DriverMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Put,
    Get,
    Delete,
    List,
    Transaction,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Verb::Put => "put",
            Verb::Get => "get",
            Verb::Delete => "delete",
            Verb::List => "list",
            Verb::Transaction => "transaction",
        }
    }
}

/// Precomputed metric names for one driver instance.
#[derive(Debug, Clone)]
pub struct DriverMetrics {
    driver: String,
    sink: Arc<dyn MetricSink>,
}

impl DriverMetrics {
    pub fn new(driver: impl Into<String>, sink: Arc<dyn MetricSink>) -> Self {
        Self {
            driver: driver.into(),
            sink,
        }
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn sink(&self) -> &Arc<dyn MetricSink> {
        &self.sink
    }

    /// Record the latency of `verb` measured from `start`.
    pub fn measure(&self, verb: Verb, start: Instant) {
        self.sink
            .measure_since(&format!("{}.{}", self.driver, verb.as_str()), start);
    }

    /// Count a failed `verb`.
    pub fn failed(&self, verb: Verb) {
        self.sink
            .incr_counter(&format!("{}.{}Failed", self.driver, verb.as_str()), 1);
    }

    /// Count a server-side failure reported by the native client.
    pub fn server_error(&self) {
        self.sink.incr_counter(&format!("{}.5xx", self.driver), 1);
    }

    /// Record timing and, on error, the failure counter.
    pub fn observe<T, E>(&self, verb: Verb, start: Instant, result: &Result<T, E>) {
        self.measure(verb, start);
        if result.is_err() {
            self.failed(verb);
        }
    }
}
