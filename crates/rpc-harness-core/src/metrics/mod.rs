//! Metrics collection for the test harness.
//!
//! Provides Prometheus-compatible counters for container lifecycles, worker
//! calls, teardown failures and live namespaces.

pub mod prometheus;

pub use prometheus::HarnessMetrics;
