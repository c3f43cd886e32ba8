//! In-process counters for batch dispatch behavior.
//!
//! Lock-free so they can be updated from workers on hot paths. A snapshot
//! view is exposed for health endpoints and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Aggregated counters for planning, sending, and streaming.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Number of completed planning passes.
    plans_built: AtomicU64,
    /// Number of planning passes restarted on a region miss.
    plan_region_miss_retries: AtomicU64,
    /// Total batch tasks produced by completed plans.
    tasks_planned: AtomicU64,
    /// Total regions covered by completed plans.
    regions_planned: AtomicU64,
    /// Number of batch RPCs issued.
    batch_sends: AtomicU64,
    /// Sum of batch RPC elapsed time in nanoseconds.
    batch_send_latency_ns: AtomicU64,
    /// Number of sends that failed and were requeued for re-planning.
    send_retries: AtomicU64,
    /// Number of sub-responses enqueued on result queues.
    responses_enqueued: AtomicU64,
    /// Total payload bytes enqueued.
    response_bytes: AtomicU64,
    /// Number of streams that died mid-flight.
    stream_errors: AtomicU64,
}

/// Point-in-time copy of `DispatchMetrics`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchMetricsSnapshot {
    pub plans_built: u64,
    pub plan_region_miss_retries: u64,
    pub tasks_planned: u64,
    pub regions_planned: u64,
    pub batch_sends: u64,
    pub batch_send_latency_ns: u64,
    pub send_retries: u64,
    pub responses_enqueued: u64,
    pub response_bytes: u64,
    pub stream_errors: u64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_plan(&self, tasks: usize, regions: usize) {
        self.plans_built.fetch_add(1, Ordering::Relaxed);
        self.tasks_planned.fetch_add(tasks as u64, Ordering::Relaxed);
        self.regions_planned
            .fetch_add(regions as u64, Ordering::Relaxed);
    }

    pub fn record_plan_region_miss_retry(&self) {
        self.plan_region_miss_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_send(&self, elapsed: Duration) {
        self.batch_sends.fetch_add(1, Ordering::Relaxed);
        self.batch_send_latency_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_send_retry(&self) {
        self.send_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self, bytes: usize) {
        self.responses_enqueued.fetch_add(1, Ordering::Relaxed);
        self.response_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_stream_error(&self) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        DispatchMetricsSnapshot {
            plans_built: self.plans_built.load(Ordering::Relaxed),
            plan_region_miss_retries: self.plan_region_miss_retries.load(Ordering::Relaxed),
            tasks_planned: self.tasks_planned.load(Ordering::Relaxed),
            regions_planned: self.regions_planned.load(Ordering::Relaxed),
            batch_sends: self.batch_sends.load(Ordering::Relaxed),
            batch_send_latency_ns: self.batch_send_latency_ns.load(Ordering::Relaxed),
            send_retries: self.send_retries.load(Ordering::Relaxed),
            responses_enqueued: self.responses_enqueued.load(Ordering::Relaxed),
            response_bytes: self.response_bytes.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
        }
    }
}
