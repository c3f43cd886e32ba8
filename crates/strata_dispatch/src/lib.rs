//! Batch coprocessor dispatch for the Strata SQL engine's storage-access layer.
//!
//! A batch read names a set of key ranges plus an opaque query payload. This
//! crate plans those ranges against the current cluster topology, where each
//! shard (a region) is replicated across several stores, balances regions
//! across the stores that host them, dispatches one streamed request per
//! chosen store in parallel, and merges the partial results into a single
//! arrival-ordered result set the caller pulls from.
//!
//! The topology cache, the RPC transport, and the storage nodes themselves
//! are external collaborators behind the `TopologyCache` and `StoreClient`
//! traits; this crate owns planning, balancing, fan-out, streaming drain, and
//! failure recovery (topology invalidation, backoff, re-plan).

pub mod backoff;
pub mod balance;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod key_ranges;
pub mod metrics;
pub mod plan;
pub mod region;
pub mod sender;
pub mod topology;
pub mod transport;

pub use backoff::{BackoffKind, Backoffer};
pub use balance::balance_batch_tasks;
pub use config::{DispatchConfig, MemoryTracker, QueryVars};
pub use dispatch::{BatchResponse, BatchResults, BatchStorageClient, RequestSpec, ResponseStats};
pub use error::{DispatchError, Result};
pub use key_ranges::{KeyRange, KeyRanges};
pub use metrics::{DispatchMetrics, DispatchMetricsSnapshot};
pub use plan::{build_batch_tasks, BatchTask, CmdKind};
pub use region::{Peer, RegionEpoch, RegionInfo, RegionMeta, RegionVerId, RpcContext, StoreId, StoreKind};
pub use sender::{BatchRequestSender, SendOutcome};
pub use topology::{LocatedRanges, TopologyCache};
pub use transport::{
    BatchRequest, BatchStream, BatchStreamResponse, BatchSubResponse, IsolationLevel, Priority,
    RequestContext, RpcCanceller, StoreClient, TransportError, WireRegion,
};
