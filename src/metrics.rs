//! Metrics instrumentation for consul-dns.
//!
//! All metrics are prefixed with `consul_dns.` and are recorded through an
//! explicit [`Metrics`] handle rather than the process-global recorder, so
//! every component receives the sink it reports to.

use metrics::{Counter, Gauge, Histogram, Key, Label, Level, Metadata, NoopRecorder, Recorder};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static METADATA: Metadata<'static> =
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

/// Query result type for metrics.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// Query returned an address.
    Success,
    /// Domain not found.
    NxDomain,
    /// Non-A question answered with an empty reply.
    Unsupported,
    /// Query could not be answered (malformed request or bad stored address).
    Error,
}

impl QueryResult {
    fn as_str(self) -> &'static str {
        match self {
            QueryResult::Success => "success",
            QueryResult::NxDomain => "nxdomain",
            QueryResult::Unsupported => "unsupported",
            QueryResult::Error => "error",
        }
    }
}

/// Observability handle passed to every component.
#[derive(Clone)]
pub struct Metrics {
    recorder: Arc<dyn Recorder + Send + Sync>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::noop()
    }
}

impl Metrics {
    /// Wrap a recorder.
    pub fn new<R>(recorder: R) -> Self
    where
        R: Recorder + Send + Sync + 'static,
    {
        Self {
            recorder: Arc::new(recorder),
        }
    }

    /// A handle that discards everything.
    pub fn noop() -> Self {
        Self::new(NoopRecorder)
    }

    fn counter(&self, name: &'static str, labels: Vec<Label>) -> Counter {
        self.recorder
            .register_counter(&Key::from_parts(name, labels), &METADATA)
    }

    fn gauge(&self, name: &'static str, labels: Vec<Label>) -> Gauge {
        self.recorder
            .register_gauge(&Key::from_parts(name, labels), &METADATA)
    }

    fn histogram(&self, name: &'static str, labels: Vec<Label>) -> Histogram {
        self.recorder
            .register_histogram(&Key::from_parts(name, labels), &METADATA)
    }

    /// Record a DNS query.
    pub fn record_query(&self, record_type: &str, result: QueryResult, duration: Duration) {
        self.counter(
            "consul_dns.query.count",
            vec![
                Label::new("type", record_type.to_string()),
                Label::new("result", result.as_str()),
            ],
        )
        .increment(1);
        self.histogram(
            "consul_dns.query.duration.seconds",
            vec![Label::new("type", record_type.to_string())],
        )
        .record(duration.as_secs_f64());
    }

    /// Record an answered address query for `domain` resolving to `record`.
    pub fn record_served(&self, domain: &str, record: &str) {
        let labels = vec![
            Label::new("domain", domain.to_string()),
            Label::new("record", record.to_string()),
        ];
        self.counter("consul_dns.record.served.count", labels.clone())
            .increment(1);
        self.gauge("consul_dns.record.last_served.timestamp", labels)
            .set(unix_now());
    }

    /// Record that the published address for a service changed.
    pub fn record_selection_change(&self, service: &str) {
        self.counter(
            "consul_dns.record.selection_change.count",
            vec![Label::new("service", service.to_string())],
        )
        .increment(1);
    }

    /// Mark a service watcher as running (or stopped).
    pub fn set_monitor_running(&self, service: &str, running: bool) {
        self.gauge(
            "consul_dns.service.monitor.running",
            vec![Label::new("service", service.to_string())],
        )
        .set(if running { 1.0 } else { 0.0 });
    }

    /// Record a successful fetch of a service's healthy node list.
    pub fn record_service_update(&self, service: &str) {
        self.gauge(
            "consul_dns.service.last_updated.timestamp",
            vec![Label::new("service", service.to_string())],
        )
        .set(unix_now());
    }

    /// Record a failed fetch from the registry.
    pub fn record_fetch_failure(&self, service: &str) {
        self.counter(
            "consul_dns.service.fetch_failure.count",
            vec![Label::new("service", service.to_string())],
        )
        .increment(1);
    }

    /// Record the number of published records.
    pub fn record_state_counts(&self, records: usize) {
        self.gauge("consul_dns.state.records.count", vec![])
            .set(records as f64);
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    pub(crate) use crate::telemetry::prometheus;

    /// Value of the first sample line whose name contains `name` and which
    /// carries every `label="value"` pair given.
    pub(crate) fn sample(rendered: &str, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        rendered
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter(|line| line.split(['{', ' ']).next().is_some_and(|n| n.contains(name)))
            .filter(|line| {
                labels
                    .iter()
                    .all(|(k, v)| line.contains(&format!("{k}=\"{v}\"")))
            })
            .find_map(|line| line.rsplit(' ').next()?.parse().ok())
    }
}
