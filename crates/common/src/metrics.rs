//! Metrics collection for ShardChat
//!
//! This module provides Prometheus metrics for observability.
//! Hot-path updates are plain atomic increments and histogram observations.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for ShardChat
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub inference: InferenceMetrics,
    pub worker: WorkerMetrics,
    pub coordinator: CoordinatorMetrics,
}

/// Request-level metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Total number of generation requests
    pub requests_total: IntCounter,

    /// Requests that reached their terminal item
    pub requests_success: IntCounter,

    /// Requests that ended in a failure
    pub requests_failed: IntCounter,

    /// Request duration histogram
    pub request_duration: Histogram,

    /// Tokens generated total
    pub tokens_generated_total: IntCounter,

    /// Current active requests
    pub active_requests: IntGauge,
}

/// Shard-level metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Prefill forward pass duration
    pub prefill_duration: Histogram,

    /// Incremental step forward pass duration
    pub step_duration: Histogram,

    /// Decode steps executed
    pub decode_steps_total: IntCounter,

    /// Failure markers posted by shards
    pub shard_failures_total: IntCounter,
}

/// Orchestrator metrics
#[derive(Debug, Clone)]
pub struct CoordinatorMetrics {
    /// Time spent waiting for the primary shard to report ready
    pub ready_wait: Histogram,

    /// Items relayed to callers
    pub items_relayed_total: IntCounter,

    /// Deadlines exceeded while waiting on shards
    pub worker_timeouts_total: IntCounter,

    /// Replica outputs that diverged from the primary
    pub shard_desyncs_total: IntCounter,

    /// Stale markers discarded while waiting for ready
    pub stale_markers_total: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry =
        MetricsRegistry::new().expect("metric definitions are valid");
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let metric = IntCounter::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let metric = IntGauge::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: Vec<f64>,
) -> prometheus::Result<Histogram> {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let inference = InferenceMetrics {
            requests_total: counter(
                &registry,
                "inference_requests_total",
                "Total number of generation requests",
            )?,
            requests_success: counter(
                &registry,
                "inference_requests_success_total",
                "Total number of completed generation requests",
            )?,
            requests_failed: counter(
                &registry,
                "inference_requests_failed_total",
                "Total number of failed generation requests",
            )?,
            request_duration: histogram(
                &registry,
                "inference_request_duration_seconds",
                "Generation request duration in seconds",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            )?,
            tokens_generated_total: counter(
                &registry,
                "inference_tokens_generated_total",
                "Total number of tokens generated",
            )?,
            active_requests: gauge(
                &registry,
                "inference_active_requests",
                "Current number of active generation requests",
            )?,
        };

        let worker = WorkerMetrics {
            prefill_duration: histogram(
                &registry,
                "worker_prefill_duration_seconds",
                "Prefill forward pass duration in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
            )?,
            step_duration: histogram(
                &registry,
                "worker_step_duration_seconds",
                "Incremental forward pass duration in seconds",
                vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1],
            )?,
            decode_steps_total: counter(
                &registry,
                "worker_decode_steps_total",
                "Total number of decode steps executed",
            )?,
            shard_failures_total: counter(
                &registry,
                "worker_shard_failures_total",
                "Total number of failure markers posted by shards",
            )?,
        };

        let coordinator = CoordinatorMetrics {
            ready_wait: histogram(
                &registry,
                "coordinator_ready_wait_seconds",
                "Time spent waiting for the primary shard to become ready",
                vec![0.0001, 0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0],
            )?,
            items_relayed_total: counter(
                &registry,
                "coordinator_items_relayed_total",
                "Total number of streamed items relayed to callers",
            )?,
            worker_timeouts_total: counter(
                &registry,
                "coordinator_worker_timeouts_total",
                "Total number of shard deadlines exceeded",
            )?,
            shard_desyncs_total: counter(
                &registry,
                "coordinator_shard_desyncs_total",
                "Total number of replica divergences detected",
            )?,
            stale_markers_total: counter(
                &registry,
                "coordinator_stale_markers_total",
                "Total number of stale markers drained before a request",
            )?,
        };

        Ok(MetricsRegistry {
            registry,
            inference,
            worker,
            coordinator,
        })
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
