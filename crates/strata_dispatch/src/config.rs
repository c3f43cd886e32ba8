//! Dispatch tuning knobs and per-query control state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Bounded capacity of the result queue between workers and the iterator.
pub const RESULT_QUEUE_CAPACITY: usize = 2048;
/// Interval at which `next()` wakes up to check the per-query kill flag.
pub const KILL_CHECK_INTERVAL: Duration = Duration::from_secs(3);
/// Planning wall-time beyond which a warning is logged.
pub const PLAN_WARN_THRESHOLD: Duration = Duration::from_millis(500);
/// Total backoff budget while building batch tasks, in milliseconds.
pub const PLAN_MAX_BACKOFF_MS: u64 = 5_000;
/// Total backoff budget for one worker's send/stream lifetime, in milliseconds.
pub const TASK_MAX_BACKOFF_MS: u64 = 20_000;
/// Read timeout for one streamed batch request. A batch stream stays open
/// for the lifetime of the heaviest region scan it carries.
pub const BATCH_STREAM_TIMEOUT: Duration = Duration::from_secs(3600);

/// Operational tuning for the dispatch core.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Capacity of the worker→iterator result queue.
    pub result_queue_capacity: usize,
    /// Kill-flag polling interval in `next()`.
    pub kill_check_interval: Duration,
    /// Backoff budget for planning, in milliseconds.
    pub plan_max_backoff_ms: u64,
    /// Backoff budget per worker, in milliseconds.
    pub task_max_backoff_ms: u64,
    /// Transport timeout for one streamed batch request.
    pub stream_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            result_queue_capacity: RESULT_QUEUE_CAPACITY,
            kill_check_interval: KILL_CHECK_INTERVAL,
            plan_max_backoff_ms: PLAN_MAX_BACKOFF_MS,
            task_max_backoff_ms: TASK_MAX_BACKOFF_MS,
            stream_timeout: BATCH_STREAM_TIMEOUT,
        }
    }
}

/// Per-query control flags shared between the session layer and workers.
#[derive(Debug, Default)]
pub struct QueryVars {
    killed: AtomicBool,
}

impl QueryVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request interruption; observed at the next kill-check tick and at
    /// every backoff cycle.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// Memory-accounting hook for result buffers held in the result queue.
///
/// `consume` takes a signed delta; implementations aggregate into the
/// session's memory budget.
pub trait MemoryTracker: Send + Sync {
    fn consume(&self, bytes: i64);
}
