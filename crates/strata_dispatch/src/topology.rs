//! Seam to the cluster topology cache.
//!
//! The cache owns the key→region mapping and replica routing state. The
//! dispatch core only reads from it, except for the send-failure notification
//! path which lets the cache mark replicas stale and reload them on the next
//! lookup. Implementations synchronize internally; workers must not assume
//! read-after-write visibility beyond what these methods promise.

use async_trait::async_trait;

use crate::backoff::Backoffer;
use crate::error::Result;
use crate::key_ranges::KeyRanges;
use crate::region::{RegionInfo, RegionVerId, RpcContext, StoreId, StoreKind};

/// One region paired with the sub-ranges of a request it covers.
#[derive(Clone, Debug)]
pub struct LocatedRanges {
    pub region: RegionVerId,
    pub ranges: KeyRanges,
}

/// Read-mostly view of cluster topology consumed by the planner and sender.
#[async_trait]
pub trait TopologyCache: Send + Sync {
    /// Split `ranges` at region boundaries, emitting one entry per
    /// `(region, sub-ranges)` pair in key order.
    async fn locate_ranges(
        &self,
        bo: &mut Backoffer,
        ranges: &KeyRanges,
    ) -> Result<Vec<LocatedRanges>>;

    /// Resolve a routing tuple for `region` targeting a replica of the given
    /// storage class. `None` means the cache has evicted the region; the
    /// caller is expected to back off and re-plan so the cache reloads it.
    async fn rpc_context(
        &self,
        bo: &mut Backoffer,
        region: &RegionVerId,
        store_kind: StoreKind,
        force_primary: bool,
    ) -> Result<Option<RpcContext>>;

    /// Every store currently considered a valid replica host for `region`,
    /// with `primary` first.
    fn all_valid_stores(&self, region: &RegionVerId, primary: StoreId) -> Vec<StoreId>;

    /// Notify the cache that a send to `ctx.store` failed for `regions`.
    /// The cache marks the replicas stale, may promote a different replica,
    /// and reloads the regions on the next lookup when `need_reload` is set.
    async fn on_send_fail(
        &self,
        bo: &mut Backoffer,
        ctx: &RpcContext,
        regions: &[RegionInfo],
        need_reload: bool,
        cause: &anyhow::Error,
    );

    /// Reject snapshot timestamps that fell behind the storage GC safe point.
    fn check_visibility(&self, start_ts: u64) -> Result<()>;
}
