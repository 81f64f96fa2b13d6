//! Metrics for pyramid evaluation
//!
//! ## Table of Contents
//! - **PyramidMetrics**: Prometheus registry with per-pyramid counters and gauges
//! - **TaskGuard**: Drop guard accounting for one running evaluation task

use crate::error::{PyramidError, Result};
use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry};
use std::time::Instant;

/// Core metrics for pyramid evaluation
pub struct PyramidMetrics {
    registry: Registry,

    // Emission metrics
    pub estimates_emitted: CounterVec,
    pub emissions_suppressed: CounterVec,

    // Outcome metrics
    pub failures: CounterVec,
    pub cancellations: CounterVec,

    // Task metrics
    pub active_tasks: IntGaugeVec,
    pub task_duration: HistogramVec,
}

impl PyramidMetrics {
    /// Create a new metrics instance
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        // Emission metrics
        let estimates_emitted = CounterVec::new(
            Opts::new("pyramid_estimates_emitted_total", "Total estimates emitted"),
            &["pyramid", "kind"],
        )?;
        let emissions_suppressed = CounterVec::new(
            Opts::new(
                "pyramid_emissions_suppressed_total",
                "Aggregates withheld because their degree did not improve",
            ),
            &["pyramid"],
        )?;

        // Outcome metrics
        let failures = CounterVec::new(
            Opts::new("pyramid_failures_total", "Evaluations that ended in an error"),
            &["pyramid"],
        )?;
        let cancellations = CounterVec::new(
            Opts::new("pyramid_cancellations_total", "Evaluations stopped by their consumer"),
            &["pyramid"],
        )?;

        // Task metrics
        let active_tasks = IntGaugeVec::new(
            Opts::new("pyramid_active_tasks", "Evaluation tasks currently running"),
            &["pyramid"],
        )?;
        let task_duration = HistogramVec::new(
            HistogramOpts::new("pyramid_task_duration_seconds", "Evaluation task lifetime")
                .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["pyramid"],
        )?;

        registry.register(Box::new(estimates_emitted.clone()))?;
        registry.register(Box::new(emissions_suppressed.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(cancellations.clone()))?;
        registry.register(Box::new(active_tasks.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;

        Ok(Self {
            registry,
            estimates_emitted,
            emissions_suppressed,
            failures,
            cancellations,
            active_tasks,
            task_duration,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an emitted estimate; `kind` is `leaf` or `aggregate`
    pub fn record_emitted(&self, pyramid: &str, kind: &str) {
        self.estimates_emitted
            .with_label_values(&[pyramid, kind])
            .inc();
    }

    /// Record an aggregate withheld for not improving the degree
    pub fn record_suppressed(&self, pyramid: &str) {
        self.emissions_suppressed.with_label_values(&[pyramid]).inc();
    }

    /// Record a failed evaluation
    pub fn record_failure(&self, pyramid: &str) {
        self.failures.with_label_values(&[pyramid]).inc();
    }

    /// Record an evaluation cancelled by its consumer
    pub fn record_cancellation(&self, pyramid: &str) {
        self.cancellations.with_label_values(&[pyramid]).inc();
    }

    /// Count a running task until the returned guard is dropped
    pub fn track_task(&self, pyramid: &str) -> TaskGuard {
        let gauge = self.active_tasks.with_label_values(&[pyramid]);
        gauge.inc();
        TaskGuard {
            gauge,
            duration: self.task_duration.with_label_values(&[pyramid]),
            started: Instant::now(),
        }
    }

    /// Number of tasks currently running for `pyramid`
    pub fn active_tasks(&self, pyramid: &str) -> i64 {
        self.active_tasks.with_label_values(&[pyramid]).get()
    }

    /// Total estimates emitted by `pyramid` of the given kind
    pub fn emitted(&self, pyramid: &str, kind: &str) -> u64 {
        self.estimates_emitted
            .with_label_values(&[pyramid, kind])
            .get() as u64
    }

    /// Gather all metrics as text
    pub fn gather_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| PyramidError::metrics(format!("Encode error: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| PyramidError::metrics(format!("UTF8 error: {}", e)))
    }
}

/// Accounts for one evaluation task in `pyramid_active_tasks`
///
/// Dropped when the task finishes, fails or is aborted.
pub struct TaskGuard {
    gauge: prometheus::IntGauge,
    duration: prometheus::Histogram,
    started: Instant,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.gauge.dec();
        self.duration.observe(self.started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = PyramidMetrics::new().unwrap();
        assert!(metrics.gather_text().is_ok());
    }

    #[test]
    fn test_emission_metrics() {
        let metrics = PyramidMetrics::new().unwrap();

        metrics.record_emitted("hazard", "leaf");
        metrics.record_emitted("hazard", "leaf");
        metrics.record_emitted("hazard", "aggregate");
        metrics.record_suppressed("hazard");

        assert_eq!(metrics.emitted("hazard", "leaf"), 2);
        assert_eq!(metrics.emitted("hazard", "aggregate"), 1);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("pyramid_estimates_emitted_total"));
        assert!(text.contains("pyramid_emissions_suppressed_total{pyramid=\"hazard\"} 1"));
    }

    #[test]
    fn test_task_guard() {
        let metrics = PyramidMetrics::new().unwrap();

        let first = metrics.track_task("hazard");
        let second = metrics.track_task("hazard");
        assert_eq!(metrics.active_tasks("hazard"), 2);

        drop(first);
        assert_eq!(metrics.active_tasks("hazard"), 1);
        drop(second);
        assert_eq!(metrics.active_tasks("hazard"), 0);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("pyramid_task_duration_seconds_count{pyramid=\"hazard\"} 2"));
    }

    #[test]
    fn test_outcome_metrics() {
        let metrics = PyramidMetrics::new().unwrap();

        metrics.record_failure("exposure");
        metrics.record_cancellation("exposure");
        metrics.record_cancellation("exposure");

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("pyramid_failures_total{pyramid=\"exposure\"} 1"));
        assert!(text.contains("pyramid_cancellations_total{pyramid=\"exposure\"} 2"));
    }
}
