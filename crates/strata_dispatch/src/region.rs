//! Region and store identities used for routing batch requests.
//!
//! A region is a contiguous key-range shard replicated across several stores.
//! Identities are versioned: two `RegionVerId`s with the same `id` but
//! different epoch numbers name the same logical shard at different points in
//! cluster time, and must never be conflated when balancing or retrying.

use crate::key_ranges::{KeyRange, KeyRanges};

/// Stable numeric identifier of a replica-hosting storage node.
pub type StoreId = u64;

/// Storage class a request is routed to.
///
/// Batch dispatch targets the columnar replicas; the row class exists so the
/// topology cache can serve both access paths from one interface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StoreKind {
    Row,
    #[default]
    Columnar,
}

/// Versioned region identity.
///
/// `conf_ver` advances on membership changes, `ver` on splits/merges. Used
/// directly as the balancer's candidate-map key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionVerId {
    pub id: u64,
    pub conf_ver: u64,
    pub ver: u64,
}

impl RegionVerId {
    pub fn new(id: u64, conf_ver: u64, ver: u64) -> Self {
        Self { id, conf_ver, ver }
    }
}

impl std::fmt::Display for RegionVerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.id, self.conf_ver, self.ver)
    }
}

/// Cluster epoch of a region, forwarded on the wire so the storage node can
/// reject stale routing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

/// One replica of a region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Peer {
    pub id: u64,
    pub store_id: StoreId,
}

/// Region metadata carried into the wire request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionMeta {
    pub id: u64,
    pub epoch: RegionEpoch,
    pub range: KeyRange,
}

/// Resolved routing tuple for one region at one point in cluster time.
#[derive(Clone, Debug)]
pub struct RpcContext {
    /// Network address currently bound to `store`.
    pub addr: String,
    pub meta: RegionMeta,
    /// Replica chosen by the topology cache for this request.
    pub peer: Peer,
    pub store: StoreId,
}

/// A region together with the sub-ranges of the request it covers and every
/// store currently believed to host a valid replica.
///
/// `all_stores[0]` is the primary (preferred) store; the balancer may assign
/// any non-pinned region to another entry of `all_stores`.
#[derive(Clone, Debug)]
pub struct RegionInfo {
    pub region: RegionVerId,
    pub meta: RegionMeta,
    pub ranges: KeyRanges,
    pub all_stores: Vec<StoreId>,
}

impl RegionInfo {
    pub fn primary_store(&self) -> Option<StoreId> {
        self.all_stores.first().copied()
    }
}
