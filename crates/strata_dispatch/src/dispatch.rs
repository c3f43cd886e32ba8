//! Query lifecycle: fan-out, streaming drain, and the pull interface.
//!
//! One worker runs per planned batch task. Workers share nothing mutable but
//! the bounded result queue and the single-shot finish signal; results are
//! delivered in arrival order, which is not tied to task submission order.
//! The finish signal is cancelled at most once, enforced by a compare-and-swap
//! on the `closed` flag; the result queue closes once every worker's sender
//! clone has dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoffer, BackoffKind};
use crate::config::{DispatchConfig, MemoryTracker, QueryVars};
use crate::error::{DispatchError, Result};
use crate::key_ranges::KeyRanges;
use crate::metrics::{DispatchMetrics, DispatchMetricsSnapshot};
use crate::plan::{build_batch_tasks, BatchTask};
use crate::region::{RegionEpoch, StoreKind};
use crate::sender::{BatchRequestSender, SendOutcome};
use crate::topology::TopologyCache;
use crate::transport::{
    BatchRequest, BatchStreamResponse, BatchSubResponse, IsolationLevel, Priority, RequestContext,
    RpcCanceller, StoreClient, WireRegion,
};

/// One logical batch read request against the storage-access layer.
///
/// `tp`, `data`, `schema_version`, `isolation_level`, `priority`,
/// `not_fill_cache`, and `task_id` are forwarded opaquely to the wire request.
#[derive(Clone, Default)]
pub struct RequestSpec {
    pub tp: i64,
    pub start_ts: u64,
    pub data: Vec<u8>,
    pub schema_version: i64,
    pub store_kind: StoreKind,
    pub keep_order: bool,
    pub desc: bool,
    pub isolation_level: IsolationLevel,
    pub priority: Priority,
    pub not_fill_cache: bool,
    pub task_id: u64,
    pub mem_tracker: Option<Arc<dyn MemoryTracker>>,
}

/// Per-response statistics aggregated from the owning worker's backoffer.
#[derive(Clone, Debug, Default)]
pub struct ResponseStats {
    /// Total backoff sleep accumulated by the worker so far.
    pub backoff_total: Duration,
    /// Completed backoff cycles per category.
    pub backoff_times: HashMap<BackoffKind, usize>,
    /// Accumulated backoff sleep per category.
    pub backoff_sleep: HashMap<BackoffKind, Duration>,
    /// Address of the store that produced this response.
    pub callee_addr: String,
    /// Elapsed time since the producing request was sent.
    pub response_time: Duration,
}

/// One partial result pulled from the iterator.
#[derive(Debug, Default)]
pub struct BatchResponse {
    data: Vec<u8>,
    start_key: Vec<u8>,
    stats: ResponseStats,
    footprint: OnceLock<i64>,
}

impl BatchResponse {
    fn new(data: Vec<u8>, start_key: Vec<u8>, stats: ResponseStats) -> Self {
        Self {
            data,
            start_key,
            stats,
            footprint: OnceLock::new(),
        }
    }

    /// Encoded partial result payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Start key of the data this response covers. Batch responses do not
    /// report one yet, so this is empty; a failed batch task is re-planned
    /// from all of its ranges rather than resumed.
    pub fn start_key(&self) -> &[u8] {
        &self.start_key
    }

    pub fn stats(&self) -> &ResponseStats {
        &self.stats
    }

    /// Approximate bytes of memory this response holds, computed once.
    pub fn memory_footprint(&self) -> i64 {
        *self.footprint.get_or_init(|| {
            (self.data.capacity() + self.start_key.capacity() + std::mem::size_of::<ResponseStats>())
                as i64
        })
    }
}

/// Element of the worker→iterator queue: a partial result or a per-task
/// fatal error.
enum QueueItem {
    Resp(BatchResponse),
    Err(DispatchError),
}

/// Entry point for batch reads; owns the collaborator handles shared by all
/// queries it dispatches.
pub struct BatchStorageClient {
    cache: Arc<dyn TopologyCache>,
    client: Arc<dyn StoreClient>,
    config: DispatchConfig,
    metrics: Arc<DispatchMetrics>,
    shutting_down: Arc<AtomicBool>,
}

impl BatchStorageClient {
    pub fn new(cache: Arc<dyn TopologyCache>, client: Arc<dyn StoreClient>) -> Self {
        Self {
            cache,
            client,
            config: DispatchConfig::default(),
            metrics: Arc::new(DispatchMetrics::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(&self) -> DispatchMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Flip the shutdown flag: every in-flight send observing it fails its
    /// query with `ShuttingDown` instead of retrying.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Plan and launch one batch query.
    ///
    /// Fatal construction-time conditions (order requested, planning failure)
    /// come back as an error-carrying result set whose first `next()` returns
    /// the error.
    pub async fn batch_query(
        &self,
        spec: RequestSpec,
        ranges: KeyRanges,
        vars: Arc<QueryVars>,
        cancel: CancellationToken,
    ) -> BatchResults {
        if spec.keep_order || spec.desc {
            return BatchResults::failed(DispatchError::OrderUnsupported);
        }

        let mut bo = Backoffer::new(
            cancel.clone(),
            self.config.plan_max_backoff_ms,
            Arc::clone(&vars),
        );
        let tasks = match build_batch_tasks(
            &mut bo,
            self.cache.as_ref(),
            &ranges,
            spec.store_kind,
            &self.metrics,
        )
        .await
        {
            Ok(tasks) => tasks,
            Err(err) => return BatchResults::failed(err),
        };

        let spec = Arc::new(spec);
        let finished = CancellationToken::new();
        let rpc_canceller = RpcCanceller::from_parent(&cancel);
        let (tx, rx) = mpsc::channel(self.config.result_queue_capacity);

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let worker = BatchWorker {
                cache: Arc::clone(&self.cache),
                sender: BatchRequestSender::new(
                    Arc::clone(&self.cache),
                    Arc::clone(&self.client),
                    Arc::clone(&self.shutting_down),
                    Arc::clone(&self.metrics),
                ),
                spec: Arc::clone(&spec),
                vars: Arc::clone(&vars),
                tx: tx.clone(),
                finished: finished.clone(),
                cancel: cancel.clone(),
                rpc_canceller: rpc_canceller.clone(),
                metrics: Arc::clone(&self.metrics),
                config: self.config.clone(),
            };
            handles.push(tokio::spawn(worker.handle_task(task)));
        }
        drop(tx);

        // The queue closes when the last worker drops its sender; this task
        // only exists so close() can wait for full worker termination.
        let workers = tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
        });

        BatchResults::streaming(BatchIterator {
            cache: Arc::clone(&self.cache),
            result_rx: rx,
            finished,
            closed: AtomicU32::new(0),
            rpc_canceller,
            vars,
            cancel,
            workers: Some(workers),
            kill_check_interval: self.config.kill_check_interval,
            start_ts: spec.start_ts,
            mem_tracker: spec.mem_tracker.clone(),
            outstanding_bytes: 0,
        })
    }
}

/// Result set of one batch query.
///
/// Construction never fails loudly: fatal planning errors surface from the
/// first `next()` call, after which the set is exhausted.
pub struct BatchResults {
    inner: ResultsInner,
}

enum ResultsInner {
    Failed(Option<DispatchError>),
    Streaming(BatchIterator),
}

impl BatchResults {
    fn failed(err: DispatchError) -> Self {
        Self {
            inner: ResultsInner::Failed(Some(err)),
        }
    }

    fn streaming(iter: BatchIterator) -> Self {
        Self {
            inner: ResultsInner::Streaming(iter),
        }
    }

    /// Next partial result. `Ok(None)` means the stream of results is over;
    /// an error is either fatal to the query or fatal to one task, and the
    /// caller decides whether to keep pulling or to close.
    pub async fn next(&mut self) -> Result<Option<BatchResponse>> {
        match &mut self.inner {
            ResultsInner::Failed(err) => match err.take() {
                Some(err) => Err(err),
                None => Ok(None),
            },
            ResultsInner::Streaming(iter) => iter.next().await,
        }
    }

    /// Release the query: single-shot close of the finish signal, cancel all
    /// in-flight RPCs, wait for workers to terminate. Idempotent.
    pub async fn close(&mut self) {
        if let ResultsInner::Streaming(iter) = &mut self.inner {
            iter.close().await;
        }
    }
}

/// Pull side of the result queue plus the query's lifecycle state.
struct BatchIterator {
    cache: Arc<dyn TopologyCache>,
    result_rx: mpsc::Receiver<QueueItem>,
    finished: CancellationToken,
    /// Guards the finish signal: 0 open, 1 closed. CAS enforces single-shot.
    closed: AtomicU32,
    rpc_canceller: RpcCanceller,
    vars: Arc<QueryVars>,
    cancel: CancellationToken,
    workers: Option<JoinHandle<()>>,
    kill_check_interval: Duration,
    start_ts: u64,
    mem_tracker: Option<Arc<dyn MemoryTracker>>,
    /// Footprint of the response most recently handed to the caller,
    /// released on the following `next()`.
    outstanding_bytes: i64,
}

impl BatchIterator {
    async fn next(&mut self) -> Result<Option<BatchResponse>> {
        if self.outstanding_bytes != 0 {
            if let Some(tracker) = &self.mem_tracker {
                tracker.consume(-self.outstanding_bytes);
            }
            self.outstanding_bytes = 0;
        }

        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.kill_check_interval,
            self.kill_check_interval,
        );
        loop {
            tokio::select! {
                item = self.result_rx.recv() => {
                    return match item {
                        None => Ok(None),
                        Some(QueueItem::Err(err)) => Err(err),
                        Some(QueueItem::Resp(resp)) => {
                            self.cache.check_visibility(self.start_ts)?;
                            if let Some(tracker) = &self.mem_tracker {
                                self.outstanding_bytes = resp.memory_footprint();
                                tracker.consume(self.outstanding_bytes);
                            }
                            Ok(Some(resp))
                        }
                    };
                }
                _ = tick.tick() => {
                    if self.vars.is_killed() {
                        return Err(DispatchError::QueryInterrupted);
                    }
                }
                _ = self.finished.cancelled() => return Ok(None),
                _ = self.cancel.cancelled() => {
                    self.close_finish_signal();
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) {
        self.close_finish_signal();
        self.rpc_canceller.cancel_all();
        if let Some(workers) = self.workers.take() {
            let _ = workers.await;
        }
    }

    fn close_finish_signal(&self) {
        if self
            .closed
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.finished.cancel();
        }
    }
}

impl Drop for BatchIterator {
    fn drop(&mut self) {
        // Unblock any worker still parked on the queue or inside an RPC.
        self.close_finish_signal();
        self.rpc_canceller.cancel_all();
    }
}

/// One worker per batch task; owns the channels it writes to and nothing of
/// the iterator itself.
struct BatchWorker {
    cache: Arc<dyn TopologyCache>,
    sender: BatchRequestSender,
    spec: Arc<RequestSpec>,
    vars: Arc<QueryVars>,
    tx: mpsc::Sender<QueueItem>,
    finished: CancellationToken,
    cancel: CancellationToken,
    rpc_canceller: RpcCanceller,
    metrics: Arc<DispatchMetrics>,
    config: DispatchConfig,
}

impl BatchWorker {
    async fn handle_task(self, task: BatchTask) {
        let mut bo = Backoffer::new(
            self.cancel.clone(),
            self.config.task_max_backoff_ms,
            Arc::clone(&self.vars),
        )
        .with_rpc_canceller(self.rpc_canceller.clone());

        let mut pending = vec![task];
        let mut idx = 0;
        while idx < pending.len() {
            match self.handle_task_once(&mut bo, &pending[idx]).await {
                Ok(mut continuation) => pending.append(&mut continuation),
                Err(err) => {
                    self.send_to_resp_ch(QueueItem::Err(err)).await;
                    break;
                }
            }
            idx += 1;
        }
    }

    /// One send attempt for `task`. An empty continuation list means the
    /// task's stream was drained; a non-empty one replaces the task after a
    /// transient send failure forced a re-plan.
    async fn handle_task_once(
        &self,
        bo: &mut Backoffer,
        task: &BatchTask,
    ) -> Result<Vec<BatchTask>> {
        let regions = task
            .regions
            .iter()
            .map(|info| WireRegion {
                region_id: info.region.id,
                epoch: RegionEpoch {
                    conf_ver: info.region.conf_ver,
                    version: info.region.ver,
                },
                ranges: info.ranges.iter().cloned().collect(),
            })
            .collect();
        let req = BatchRequest {
            tp: self.spec.tp,
            start_ts: self.spec.start_ts,
            data: self.spec.data.clone(),
            schema_version: self.spec.schema_version,
            regions,
            context: RequestContext {
                isolation_level: self.spec.isolation_level,
                priority: self.spec.priority,
                not_fill_cache: self.spec.not_fill_cache,
                task_id: self.spec.task_id,
                record_time_stat: true,
                record_scan_stat: true,
                region_epoch: None,
                peer: None,
            },
        };

        tracing::debug!(
            store = %task.store_addr,
            regions = task.regions.len(),
            "send batch request"
        );
        let sent = self
            .sender
            .send_to_addr(
                bo,
                &task.rpc_ctx,
                &task.regions,
                req,
                self.config.stream_timeout,
            )
            .await?;

        match sent {
            // Store-level failure: retry for all regions of this task.
            SendOutcome::Retry => self.retry_task(bo, task).await,
            SendOutcome::Response { resp, guard } => {
                let result = self.consume_stream(bo, resp, task).await;
                drop(guard);
                result.map(|()| Vec::new())
            }
        }
    }

    /// Merge all ranges of the failed task and plan them again.
    async fn retry_task(&self, bo: &mut Backoffer, task: &BatchTask) -> Result<Vec<BatchTask>> {
        let ranges = task.merged_ranges();
        build_batch_tasks(
            bo,
            self.cache.as_ref(),
            &ranges,
            self.spec.store_kind,
            &self.metrics,
        )
        .await
    }

    /// Drive one streaming response to completion, forwarding every
    /// sub-response to the result queue.
    async fn consume_stream(
        &self,
        bo: &mut Backoffer,
        response: BatchStreamResponse,
        task: &BatchTask,
    ) -> Result<()> {
        let started = Instant::now();
        let BatchStreamResponse { first, mut stream } = response;
        // A stream that ends before producing anything is a clean success.
        let Some(mut current) = first else {
            return Ok(());
        };
        loop {
            if !self.forward_sub_response(bo, current, task, started).await? {
                return Ok(());
            }
            match stream.recv().await {
                Ok(Some(next)) => current = next,
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.metrics.record_stream_error();
                    tracing::info!(
                        store = %task.store_addr,
                        error = %err,
                        "batch stream receive failed"
                    );
                    let cause = anyhow::anyhow!(
                        "recv stream response error: {err}, store: {}",
                        task.store_addr
                    );
                    if bo.backoff(BackoffKind::StreamRecv, cause).await.is_err() {
                        return Err(DispatchError::Transport(anyhow::Error::new(err)));
                    }
                    // The storage node checkpoints no stream progress, so the
                    // stream cannot be reissued; surface a timeout instead.
                    return Err(DispatchError::ServerTimeout {
                        addr: task.store_addr.clone(),
                    });
                }
            }
        }
    }

    /// Package one sub-response with request statistics and enqueue it.
    /// Returns `Ok(false)` when the finish signal aborted the drain.
    async fn forward_sub_response(
        &self,
        bo: &Backoffer,
        sub: BatchSubResponse,
        task: &BatchTask,
        started: Instant,
    ) -> Result<bool> {
        if let Some(reason) = sub.other_error {
            tracing::warn!(
                start_ts = self.spec.start_ts,
                store = %task.store_addr,
                error = %reason,
                "batch response carries other error"
            );
            return Err(DispatchError::Other { reason });
        }

        let stats = ResponseStats {
            backoff_total: Duration::from_millis(bo.total_sleep_ms()),
            backoff_times: bo.times().clone(),
            backoff_sleep: bo
                .sleep_by_kind_ms()
                .iter()
                .map(|(kind, ms)| (*kind, Duration::from_millis(*ms)))
                .collect(),
            callee_addr: task.store_addr.clone(),
            response_time: started.elapsed(),
        };
        let resp = BatchResponse::new(sub.data, Vec::new(), stats);
        self.metrics.record_response(resp.data().len());
        Ok(self.send_to_resp_ch(QueueItem::Resp(resp)).await)
    }

    /// Blocking enqueue that aborts when the finish signal fires. Returns
    /// whether the item was delivered.
    async fn send_to_resp_ch(&self, item: QueueItem) -> bool {
        let footprint = match &item {
            QueueItem::Resp(resp) => resp.memory_footprint(),
            QueueItem::Err(_) => 0,
        };
        let delivered = tokio::select! {
            sent = self.tx.send(item) => sent.is_ok(),
            _ = self.finished.cancelled() => false,
        };
        if delivered && footprint != 0 {
            if let Some(tracker) = &self.spec.mem_tracker {
                tracker.consume(footprint);
            }
        }
        delivered
    }
}
