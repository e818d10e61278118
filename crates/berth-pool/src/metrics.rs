use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{global, KeyValue};

use crate::pool::WorkerUnfitReason;

const REASON_KEY: &str = "reason";

/// The instruments emitted by the worker pool. All counters are recorded
/// with zero at construction so that they exist before the first task runs
/// on the node.
pub struct PoolMetrics {
    worker_register_time: Histogram<f64>,
    num_workers_started: Counter<u64>,
    num_workers_started_from_cache: Counter<u64>,
    num_cached_workers_skipped: Counter<u64>,
}

impl PoolMetrics {
    pub fn new() -> Self {
        let meter = global::meter("berth_pool");
        let metrics = Self {
            worker_register_time: meter
                .f64_histogram("worker_register_time")
                .with_unit("ms")
                .with_boundaries(vec![1.0, 10.0, 100.0, 1000.0, 10000.0])
                .with_description("End-to-end latency of worker registration.")
                .build(),
            num_workers_started: meter
                .u64_counter("num_worker_processes_started")
                .with_description("Number of worker processes started by the pool.")
                .build(),
            num_workers_started_from_cache: meter
                .u64_counter("num_workers_started_from_cache")
                .with_description("Number of pop requests served from idle workers.")
                .build(),
            num_cached_workers_skipped: meter
                .u64_counter("num_cached_workers_skipped")
                .with_description("Number of idle workers skipped during matching, by reason.")
                .build(),
        };
        metrics.num_workers_started.add(0, &[]);
        metrics.num_workers_started_from_cache.add(0, &[]);
        for reason in [
            WorkerUnfitReason::RootMismatch,
            WorkerUnfitReason::RuntimeEnvMismatch,
            WorkerUnfitReason::DynamicOptionsMismatch,
        ] {
            if let Some(attribute) = Self::reason_attribute(reason) {
                metrics.num_cached_workers_skipped.add(0, &[attribute]);
            }
        }
        metrics
    }

    pub fn record_register_time(&self, millis: f64) {
        self.worker_register_time.record(millis, &[]);
    }

    pub fn inc_workers_started(&self) {
        self.num_workers_started.add(1, &[]);
    }

    pub fn inc_workers_started_from_cache(&self) {
        self.num_workers_started_from_cache.add(1, &[]);
    }

    pub fn inc_cached_workers_skipped(&self, reason: WorkerUnfitReason) {
        if let Some(attribute) = Self::reason_attribute(reason) {
            self.num_cached_workers_skipped.add(1, &[attribute]);
        }
    }

    fn reason_attribute(reason: WorkerUnfitReason) -> Option<KeyValue> {
        let value = match reason {
            WorkerUnfitReason::RootMismatch => "job",
            WorkerUnfitReason::RuntimeEnvMismatch => "runtime_env",
            WorkerUnfitReason::DynamicOptionsMismatch => "dynamic_options",
            WorkerUnfitReason::Other => return None,
        };
        Some(KeyValue::new(REASON_KEY, value))
    }
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}
