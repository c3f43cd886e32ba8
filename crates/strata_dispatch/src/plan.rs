//! Turning key ranges into per-store batch tasks.
//!
//! Planning resolves the current topology: the input ranges are split at
//! region boundaries, each region gets a routing tuple for a storage-class
//! replica, and regions landing on the same store address are grouped into
//! one batch task. A region evicted from the cache does not abort the pass;
//! the remaining regions are still resolved so the cache reloads everything
//! before the retry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Instant;

use crate::backoff::{Backoffer, BackoffKind};
use crate::balance::balance_batch_tasks;
use crate::config::PLAN_WARN_THRESHOLD;
use crate::error::Result;
use crate::key_ranges::{KeyRange, KeyRanges};
use crate::metrics::DispatchMetrics;
use crate::region::{RegionInfo, RpcContext, StoreKind};
use crate::topology::TopologyCache;

/// Command kind stamped on every batch task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CmdKind {
    #[default]
    BatchQuery,
}

/// All regions of one store bundled into a single streamed request.
///
/// Every region in `regions` is currently believed to be hosted on
/// `store_addr`, either as its primary or as a balancer-chosen candidate.
#[derive(Clone, Debug)]
pub struct BatchTask {
    pub store_addr: String,
    pub cmd: CmdKind,
    pub rpc_ctx: RpcContext,
    pub regions: Vec<RegionInfo>,
}

impl BatchTask {
    /// Union of the ranges of every region in this task, in region order.
    ///
    /// The storage node reports no per-region progress, so a failed task can
    /// only be re-planned from all of its originally requested ranges.
    pub fn merged_ranges(&self) -> KeyRanges {
        let mut ranges: Vec<KeyRange> = Vec::new();
        for info in &self.regions {
            info.ranges.for_each(|r| ranges.push(r.clone()));
        }
        KeyRanges::new(ranges)
    }
}

/// Build one batch task per store for `ranges`, retrying with a region-miss
/// backoff until every region resolves to a routing tuple.
pub async fn build_batch_tasks(
    bo: &mut Backoffer,
    cache: &dyn TopologyCache,
    ranges: &KeyRanges,
    store_kind: StoreKind,
    metrics: &DispatchMetrics,
) -> Result<Vec<BatchTask>> {
    let started = Instant::now();
    let range_len = ranges.len();
    loop {
        let located = cache.locate_ranges(bo, ranges).await?;

        let mut store_tasks: HashMap<String, BatchTask> = HashMap::new();
        let mut need_retry = false;
        for loc in located {
            let ctx = cache.rpc_context(bo, &loc.region, store_kind, false).await?;
            // An evicted region means the cached topology is out of date.
            // Keep resolving the rest so the cache reloads them all before
            // the next pass.
            let Some(ctx) = ctx else {
                need_retry = true;
                tracing::info!(region = %loc.region, "retrying plan with region missing");
                continue;
            };
            let all_stores = cache.all_valid_stores(&loc.region, ctx.store);
            let info = RegionInfo {
                region: loc.region,
                meta: ctx.meta.clone(),
                ranges: loc.ranges,
                all_stores,
            };
            match store_tasks.entry(ctx.addr.clone()) {
                Entry::Occupied(mut entry) => entry.get_mut().regions.push(info),
                Entry::Vacant(entry) => {
                    entry.insert(BatchTask {
                        store_addr: ctx.addr.clone(),
                        cmd: CmdKind::BatchQuery,
                        rpc_ctx: ctx,
                        regions: vec![info],
                    });
                }
            }
        }

        if need_retry {
            metrics.record_plan_region_miss_retry();
            bo.backoff(
                BackoffKind::RegionMiss,
                anyhow::anyhow!("cannot find region with a valid replica"),
            )
            .await?;
            continue;
        }

        let tasks = balance_batch_tasks(store_tasks.into_values().collect());

        let elapsed = started.elapsed();
        if elapsed > PLAN_WARN_THRESHOLD {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                range_len,
                task_len = tasks.len(),
                "building batch tasks took too long"
            );
        }
        let region_count = tasks.iter().map(|t| t.regions.len()).sum();
        metrics.record_plan(tasks.len(), region_count);
        return Ok(tasks);
    }
}
