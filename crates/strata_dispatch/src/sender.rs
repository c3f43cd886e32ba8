//! Sending one batch request to one store and classifying the outcome.
//!
//! A successful transport-level send is a successful send: region-level and
//! lock-level conditions inside the response body are retried by the storage
//! node itself and are never interpreted here. Transport failures notify the
//! topology cache, charge one store-rpc backoff cycle, and ask the worker to
//! re-plan; cancellation and shutdown are fatal and never retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::DropGuard;

use crate::backoff::{Backoffer, BackoffKind};
use crate::error::{DispatchError, Result};
use crate::metrics::DispatchMetrics;
use crate::region::{RegionInfo, RpcContext};
use crate::topology::TopologyCache;
use crate::transport::{BatchRequest, BatchStreamResponse, StoreClient, TransportError};

/// Releases the per-RPC cancellation registration when dropped.
///
/// Holds nothing when no ambient registry was attached to the backoffer; the
/// handle is then a no-op.
pub struct RpcCancelGuard {
    _guard: Option<DropGuard>,
}

/// Outcome of one send attempt.
pub enum SendOutcome {
    /// The stream is open; the guard must outlive the drain.
    Response {
        resp: BatchStreamResponse,
        guard: RpcCancelGuard,
    },
    /// Transient failure, topology notified and backoff charged; the caller
    /// should re-plan all regions of this task.
    Retry,
}

/// Sends batch requests to storage nodes on behalf of one query's workers.
pub struct BatchRequestSender {
    cache: Arc<dyn TopologyCache>,
    client: Arc<dyn StoreClient>,
    shutting_down: Arc<AtomicBool>,
    metrics: Arc<DispatchMetrics>,
}

impl BatchRequestSender {
    pub fn new(
        cache: Arc<dyn TopologyCache>,
        client: Arc<dyn StoreClient>,
        shutting_down: Arc<AtomicBool>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            cache,
            client,
            shutting_down,
            metrics,
        }
    }

    /// Send `req` to the store resolved in `rpc_ctx`.
    ///
    /// The request is stamped with the routing epoch and replica identity
    /// before dispatch. When the backoffer carries the ambient cancellation
    /// registry, the RPC runs under a child token so it can be cancelled
    /// alone.
    pub async fn send_to_addr(
        &self,
        bo: &mut Backoffer,
        rpc_ctx: &RpcContext,
        regions: &[RegionInfo],
        mut req: BatchRequest,
        timeout: Duration,
    ) -> Result<SendOutcome> {
        req.set_context(&rpc_ctx.meta, rpc_ctx.peer);

        let (cancel, guard) = match bo.rpc_canceller() {
            Some(canceller) => {
                let token = canceller.child();
                (
                    token.clone(),
                    RpcCancelGuard {
                        _guard: Some(token.drop_guard()),
                    },
                )
            }
            None => (bo.cancel_token().clone(), RpcCancelGuard { _guard: None }),
        };

        let started = Instant::now();
        let sent = self
            .client
            .send_batch(cancel, &rpc_ctx.addr, req, timeout)
            .await;
        self.metrics.record_batch_send(started.elapsed());

        match sent {
            Ok(resp) => Ok(SendOutcome::Response { resp, guard }),
            Err(err) => {
                drop(guard);
                self.on_send_fail(bo, rpc_ctx, regions, err).await?;
                Ok(SendOutcome::Retry)
            }
        }
    }

    async fn on_send_fail(
        &self,
        bo: &mut Backoffer,
        rpc_ctx: &RpcContext,
        regions: &[RegionInfo],
        err: TransportError,
    ) -> Result<()> {
        // A send we cancelled ourselves must not be retried.
        if err.is_cancelled() || bo.cancel_token().is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }

        let cause = anyhow::Error::new(err);
        tracing::warn!(
            store = %rpc_ctx.addr,
            regions = regions.len(),
            error = %cause,
            "batch send failed, will re-plan after backoff"
        );
        self.cache
            .on_send_fail(bo, rpc_ctx, regions, true, &cause)
            .await;
        self.metrics.record_send_retry();
        bo.backoff(
            BackoffKind::StoreRpc,
            anyhow::anyhow!(
                "send batch request error: {cause}, store: {}, try next peer later",
                rpc_ctx.addr
            ),
        )
        .await
    }
}
