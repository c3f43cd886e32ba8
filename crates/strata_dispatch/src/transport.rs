//! Wire shapes and the injected RPC transport seam.
//!
//! The dispatch core never opens sockets itself: it assembles a
//! `BatchRequest`, hands it to a `StoreClient`, and drains the returned
//! `BatchStreamResponse`. The first sub-response is attached to the handle by
//! the transport so an immediately-empty stream is distinguishable from a
//! failed one.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::key_ranges::KeyRange;
use crate::region::{Peer, RegionEpoch, RegionMeta};

/// Isolation level forwarded to the storage node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    SnapshotIsolation,
    ReadCommitted,
}

/// Scheduling priority forwarded to the storage node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// One region entry of a batch request: identity, epoch, and the sub-ranges
/// of the query the region covers.
#[derive(Clone, Debug)]
pub struct WireRegion {
    pub region_id: u64,
    pub epoch: RegionEpoch,
    pub ranges: Vec<KeyRange>,
}

/// Request metadata forwarded verbatim to the storage node.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub isolation_level: IsolationLevel,
    pub priority: Priority,
    pub not_fill_cache: bool,
    pub task_id: u64,
    pub record_time_stat: bool,
    pub record_scan_stat: bool,
    /// Epoch of the routing region, stamped by the sender before dispatch.
    pub region_epoch: Option<RegionEpoch>,
    /// Replica the request is addressed to, stamped by the sender.
    pub peer: Option<Peer>,
}

/// A batch coprocessor request bundling many regions of one store into a
/// single streamed RPC.
#[derive(Clone, Debug)]
pub struct BatchRequest {
    pub tp: i64,
    pub start_ts: u64,
    pub data: Vec<u8>,
    pub schema_version: i64,
    pub regions: Vec<WireRegion>,
    pub context: RequestContext,
}

impl BatchRequest {
    /// Stamp the routing epoch and replica identity resolved for this send.
    pub fn set_context(&mut self, meta: &RegionMeta, peer: Peer) {
        self.context.region_epoch = Some(meta.epoch);
        self.context.peer = Some(peer);
    }
}

/// One unit of a streamed batch response.
#[derive(Clone, Debug, Default)]
pub struct BatchSubResponse {
    /// Encoded partial result payload.
    pub data: Vec<u8>,
    /// Protocol-level error reported by the storage node, fatal to the task.
    pub other_error: Option<String>,
}

/// Transport-level failure, split so cancellation is classifiable without
/// string inspection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rpc cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Server-streamed response to one batch request.
///
/// `first` is pre-fetched by the transport; `None` means the stream ended
/// before producing anything.
pub struct BatchStreamResponse {
    pub first: Option<BatchSubResponse>,
    pub stream: Box<dyn BatchStream>,
}

/// Pull interface over the remainder of a streamed response.
#[async_trait]
pub trait BatchStream: Send {
    /// Next sub-response; `Ok(None)` is a clean end of stream.
    async fn recv(&mut self) -> Result<Option<BatchSubResponse>, TransportError>;
}

/// RPC transport that sends one batch request to one store address.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Open the streamed request against `addr`. The transport must abort the
    /// call when `cancel` fires and surface it as `TransportError::Cancelled`.
    async fn send_batch(
        &self,
        cancel: CancellationToken,
        addr: &str,
        req: BatchRequest,
        timeout: Duration,
    ) -> Result<BatchStreamResponse, TransportError>;
}

/// Registry of in-flight RPCs for one query.
///
/// Each send runs under a child token so it can be cancelled alone; closing
/// the iterator cancels the root and with it every outstanding RPC.
#[derive(Clone, Debug, Default)]
pub struct RpcCanceller {
    root: CancellationToken,
}

impl RpcCanceller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry nested under the caller's cancellation context, so caller
    /// cancellation reaches every in-flight RPC as well.
    pub fn from_parent(parent: &CancellationToken) -> Self {
        Self {
            root: parent.child_token(),
        }
    }

    /// Token scoped to a single in-flight RPC.
    pub fn child(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Cancel every outstanding RPC registered through `child`.
    pub fn cancel_all(&self) {
        self.root.cancel();
    }
}
