//! Retry throttling with per-category accounting.
//!
//! Every worker owns one `Backoffer` derived from the caller's cancellation
//! context. Each failure class (`BackoffKind`) accrues sleep independently
//! against a shared total budget; once the budget is spent the backoffer
//! returns the error that forced the last cycle and the query fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::QueryVars;
use crate::error::{DispatchError, Result};
use crate::transport::RpcCanceller;

/// Failure category a backoff cycle is charged to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackoffKind {
    /// A region was evicted from the topology cache during planning.
    RegionMiss,
    /// A batch RPC to a storage node failed at the transport level.
    StoreRpc,
    /// A streaming response failed mid-flight.
    StreamRecv,
}

impl BackoffKind {
    /// Initial sleep for the first cycle of this category, in milliseconds.
    fn base_ms(self) -> u64 {
        match self {
            BackoffKind::RegionMiss => 2,
            BackoffKind::StoreRpc => 100,
            BackoffKind::StreamRecv => 100,
        }
    }

    /// Upper bound for a single sleep of this category, in milliseconds.
    fn cap_ms(self) -> u64 {
        match self {
            BackoffKind::RegionMiss => 500,
            BackoffKind::StoreRpc => 2_000,
            BackoffKind::StreamRecv => 2_000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackoffKind::RegionMiss => "region-miss",
            BackoffKind::StoreRpc => "store-rpc",
            BackoffKind::StreamRecv => "stream-recv",
        }
    }
}

impl std::fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy-driven sleep interposed between retry attempts.
///
/// Not shared between workers. The caller token aborts an in-progress sleep;
/// the per-query kill flag is honored at every cycle.
pub struct Backoffer {
    cancel: CancellationToken,
    vars: Arc<QueryVars>,
    max_sleep_ms: u64,
    total_sleep_ms: u64,
    next_sleep_ms: HashMap<BackoffKind, u64>,
    times: HashMap<BackoffKind, usize>,
    sleep_by_kind: HashMap<BackoffKind, u64>,
    rpc_canceller: Option<RpcCanceller>,
}

impl Backoffer {
    /// A backoffer bound to the caller's cancellation context with a total
    /// sleep budget in milliseconds.
    pub fn new(cancel: CancellationToken, max_sleep_ms: u64, vars: Arc<QueryVars>) -> Self {
        Self {
            cancel,
            vars,
            max_sleep_ms,
            total_sleep_ms: 0,
            next_sleep_ms: HashMap::new(),
            times: HashMap::new(),
            sleep_by_kind: HashMap::new(),
            rpc_canceller: None,
        }
    }

    /// Attach the ambient in-flight RPC cancellation registry.
    pub fn with_rpc_canceller(mut self, canceller: RpcCanceller) -> Self {
        self.rpc_canceller = Some(canceller);
        self
    }

    pub fn rpc_canceller(&self) -> Option<&RpcCanceller> {
        self.rpc_canceller.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sleep one cycle for `kind`, charging it against the shared budget.
    ///
    /// Returns `BackoffExhausted` carrying `cause` once the budget is spent,
    /// `Cancelled` if the caller context fires mid-sleep, `QueryInterrupted`
    /// if the kill flag is set.
    pub async fn backoff(&mut self, kind: BackoffKind, cause: anyhow::Error) -> Result<()> {
        if self.vars.is_killed() {
            return Err(DispatchError::QueryInterrupted);
        }
        if self.total_sleep_ms >= self.max_sleep_ms {
            return Err(DispatchError::BackoffExhausted {
                kind,
                total_sleep_ms: self.total_sleep_ms,
                cause,
            });
        }

        let next = self
            .next_sleep_ms
            .entry(kind)
            .or_insert_with(|| kind.base_ms());
        let sleep_ms = (*next).min(kind.cap_ms());
        *next = next.saturating_mul(2);

        // Equal jitter: half fixed, half random, so synchronized retries fan out.
        let jittered = sleep_ms / 2 + rand::thread_rng().gen_range(0..=sleep_ms.div_ceil(2));
        let jittered = jittered.min(self.max_sleep_ms - self.total_sleep_ms);

        tracing::debug!(
            kind = kind.as_str(),
            sleep_ms = jittered,
            total_ms = self.total_sleep_ms,
            error = %cause,
            "backoff"
        );

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(jittered)) => {}
            _ = self.cancel.cancelled() => return Err(DispatchError::Cancelled),
        }

        self.total_sleep_ms += jittered;
        *self.times.entry(kind).or_insert(0) += 1;
        *self.sleep_by_kind.entry(kind).or_insert(0) += jittered;
        Ok(())
    }

    /// Total sleep accumulated across all categories, in milliseconds.
    pub fn total_sleep_ms(&self) -> u64 {
        self.total_sleep_ms
    }

    /// Number of completed cycles per category.
    pub fn times(&self) -> &HashMap<BackoffKind, usize> {
        &self.times
    }

    /// Accumulated sleep per category, in milliseconds.
    pub fn sleep_by_kind_ms(&self) -> &HashMap<BackoffKind, u64> {
        &self.sleep_by_kind
    }
}
