//! Metrics instrumentation for the bridge.

use std::time::Instant;

pub const DISPATCH_LATENCY: &str = "bridge_dispatch_latency";

/// Record round-trip latency of a dispatched command.
pub fn record_dispatch_latency(duration_ms: f64) {
    metrics::histogram!(DISPATCH_LATENCY, duration_ms);
}

pub fn increment_dispatched() {
    metrics::counter!("bridge_commands_dispatched", 1);
}

pub fn increment_timeouts() {
    metrics::counter!("bridge_command_timeouts", 1);
}

pub fn increment_connections() {
    metrics::counter!("bridge_connections", 1);
}

pub fn increment_discarded_results() {
    metrics::counter!("bridge_discarded_results", 1);
}

/// RAII timer for automatic metric recording.
pub struct MetricTimer {
    start: Instant,
    metric_name: &'static str,
}

impl MetricTimer {
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }
}

impl Drop for MetricTimer {
    fn drop(&mut self) {
        let duration_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        if self.metric_name == DISPATCH_LATENCY {
            record_dispatch_latency(duration_ms);
        }
    }
}
