//! Prometheus metrics for the test harness.
//!
//! One [`HarnessMetrics`] is shared by every scope a harness creates, so the
//! counters describe a whole test run.

use std::fmt;

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Harness metrics collection.
#[derive(Clone)]
pub struct HarnessMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Containers that finished `start`.
    pub containers_started: IntCounter,

    /// Containers that finished `stop`.
    pub containers_stopped: IntCounter,

    /// Worker invocations by service and entrypoint kind.
    pub worker_calls: IntCounterVec,

    /// Finalizers that failed during teardown.
    pub teardown_failures: IntCounter,

    /// Namespaces provisioned and not yet deleted.
    pub namespaces_active: IntGauge,
}

impl HarnessMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let containers_started = IntCounter::new(
            "rpc_harness_containers_started_total",
            "Total number of service containers started",
        )
        .expect("metric creation should succeed");

        let containers_stopped = IntCounter::new(
            "rpc_harness_containers_stopped_total",
            "Total number of service containers stopped",
        )
        .expect("metric creation should succeed");

        let worker_calls = IntCounterVec::new(
            Opts::new(
                "rpc_harness_worker_calls_total",
                "Total number of worker invocations by service and entrypoint",
            ),
            &["service", "entrypoint"],
        )
        .expect("metric creation should succeed");

        let teardown_failures = IntCounter::new(
            "rpc_harness_teardown_failures_total",
            "Total number of failed teardown actions",
        )
        .expect("metric creation should succeed");

        let namespaces_active = IntGauge::new(
            "rpc_harness_namespaces_active",
            "Current number of provisioned namespaces",
        )
        .expect("metric creation should succeed");

        registry
            .register(Box::new(containers_started.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(containers_stopped.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(worker_calls.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(teardown_failures.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(namespaces_active.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            containers_started,
            containers_stopped,
            worker_calls,
            teardown_failures,
            namespaces_active,
        }
    }

    /// Record a worker invocation.
    pub fn record_worker_call(&self, service: &str, entrypoint: &str) {
        self.worker_calls
            .with_label_values(&[service, entrypoint])
            .inc();
    }

    /// Worker invocations recorded for `service` and `entrypoint`.
    #[must_use]
    pub fn worker_call_count(&self, service: &str, entrypoint: &str) -> u64 {
        self.worker_calls
            .with_label_values(&[service, entrypoint])
            .get()
    }

    /// Record failed teardown actions.
    pub fn record_teardown_failures(&self, count: usize) {
        self.teardown_failures.inc_by(count as u64);
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl fmt::Debug for HarnessMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessMetrics")
            .field("containers_started", &self.containers_started.get())
            .field("containers_stopped", &self.containers_stopped.get())
            .field("namespaces_active", &self.namespaces_active.get())
            .finish_non_exhaustive()
    }
}

impl Default for HarnessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = HarnessMetrics::new();
        assert!(metrics.encode().is_ok());
    }

    #[test]
    fn test_worker_calls_by_label() {
        let metrics = HarnessMetrics::new();
        metrics.record_worker_call("x", "rpc");
        metrics.record_worker_call("x", "rpc");
        metrics.record_worker_call("x", "http");

        assert_eq!(metrics.worker_call_count("x", "rpc"), 2);
        assert_eq!(metrics.worker_call_count("x", "http"), 1);
        let output = metrics.encode().unwrap();
        assert!(output.contains("rpc_harness_worker_calls_total"));
    }

    #[test]
    fn test_lifecycle_counters() {
        let metrics = HarnessMetrics::new();
        metrics.containers_started.inc();
        metrics.containers_stopped.inc();
        metrics.namespaces_active.inc();
        metrics.namespaces_active.dec();
        metrics.record_teardown_failures(2);

        assert_eq!(metrics.containers_started.get(), 1);
        assert_eq!(metrics.namespaces_active.get(), 0);
        assert_eq!(metrics.teardown_failures.get(), 2);
        let output = metrics.encode().unwrap();
        assert!(output.contains("rpc_harness_namespaces_active"));
    }
}
