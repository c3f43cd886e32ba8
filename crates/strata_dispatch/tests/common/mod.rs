//! Shared mocks for dispatch integration tests.
//!
//! `MockTopology` serves a fixed region table with scriptable rpc-context
//! misses; `MockStoreClient` replays per-address send scripts so tests can
//! fail a send, stream payloads, inject mid-stream errors, or park a stream
//! until it is cancelled.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use strata_dispatch::{
    Backoffer, BatchStream, BatchStreamResponse, BatchSubResponse, KeyRange, KeyRanges,
    LocatedRanges, Peer, RegionEpoch, RegionInfo, RegionMeta, RegionVerId, Result, RpcContext,
    StoreClient, StoreId, StoreKind, TopologyCache, TransportError,
};

pub fn store_addr(store: StoreId) -> String {
    format!("store-{store}:20170")
}

struct MockRegion {
    region: RegionVerId,
    range: KeyRange,
    stores: Vec<StoreId>,
    misses: AtomicUsize,
}

/// Fixed region table standing in for the cluster topology cache.
#[derive(Default)]
pub struct MockTopology {
    regions: Vec<MockRegion>,
    /// `(store, region_count)` for every send-failure notification.
    pub send_failures: Mutex<Vec<(StoreId, usize)>>,
}

impl MockTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a region covering `[start, end)` hosted on `stores` (primary first).
    pub fn with_region(mut self, id: u64, start: &[u8], end: &[u8], stores: Vec<StoreId>) -> Self {
        self.regions.push(MockRegion {
            region: RegionVerId::new(id, 1, 1),
            range: KeyRange::new(start.to_vec(), end.to_vec()),
            stores,
            misses: AtomicUsize::new(0),
        });
        self
    }

    /// Make the next `misses` rpc-context lookups for region `id` return
    /// nothing, as if the cache had evicted it.
    pub fn with_misses(self, id: u64, misses: usize) -> Self {
        for region in &self.regions {
            if region.region.id == id {
                region.misses.store(misses, Ordering::SeqCst);
            }
        }
        self
    }

    fn meta(region: &MockRegion) -> RegionMeta {
        RegionMeta {
            id: region.region.id,
            epoch: RegionEpoch {
                conf_ver: region.region.conf_ver,
                version: region.region.ver,
            },
            range: region.range.clone(),
        }
    }
}

fn range_intersection(request: &KeyRange, region: &KeyRange) -> Option<KeyRange> {
    let start = if request.start_key >= region.start_key {
        request.start_key.clone()
    } else {
        region.start_key.clone()
    };
    let end = match (request.end_key.is_empty(), region.end_key.is_empty()) {
        (true, true) => Vec::new(),
        (true, false) => region.end_key.clone(),
        (false, true) => request.end_key.clone(),
        (false, false) => request.end_key.clone().min(region.end_key.clone()),
    };
    let intersection = KeyRange::new(start, end);
    (!intersection.is_empty()).then_some(intersection)
}

#[async_trait]
impl TopologyCache for MockTopology {
    async fn locate_ranges(
        &self,
        _bo: &mut Backoffer,
        ranges: &KeyRanges,
    ) -> Result<Vec<LocatedRanges>> {
        let mut located = Vec::new();
        for region in &self.regions {
            let mut sub = Vec::new();
            ranges.for_each(|range| {
                if let Some(intersection) = range_intersection(range, &region.range) {
                    sub.push(intersection);
                }
            });
            if !sub.is_empty() {
                located.push(LocatedRanges {
                    region: region.region,
                    ranges: KeyRanges::new(sub),
                });
            }
        }
        Ok(located)
    }

    async fn rpc_context(
        &self,
        _bo: &mut Backoffer,
        region: &RegionVerId,
        _store_kind: StoreKind,
        _force_primary: bool,
    ) -> Result<Option<RpcContext>> {
        let Some(found) = self.regions.iter().find(|r| r.region == *region) else {
            return Ok(None);
        };
        if found
            .misses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |m| m.checked_sub(1))
            .is_ok()
        {
            return Ok(None);
        }
        let store = found.stores[0];
        Ok(Some(RpcContext {
            addr: store_addr(store),
            meta: Self::meta(found),
            peer: Peer {
                id: store * 100,
                store_id: store,
            },
            store,
        }))
    }

    fn all_valid_stores(&self, region: &RegionVerId, primary: StoreId) -> Vec<StoreId> {
        let Some(found) = self.regions.iter().find(|r| r.region == *region) else {
            return vec![primary];
        };
        let mut stores = vec![primary];
        stores.extend(found.stores.iter().copied().filter(|s| *s != primary));
        stores
    }

    async fn on_send_fail(
        &self,
        _bo: &mut Backoffer,
        ctx: &RpcContext,
        regions: &[RegionInfo],
        _need_reload: bool,
        _cause: &anyhow::Error,
    ) {
        self.send_failures
            .lock()
            .unwrap()
            .push((ctx.store, regions.len()));
    }

    fn check_visibility(&self, _start_ts: u64) -> Result<()> {
        Ok(())
    }
}

/// One scripted step of a mock stream.
pub enum StreamEvent {
    /// Deliver a sub-response carrying this payload.
    Sub(Vec<u8>),
    /// Deliver a sub-response carrying a protocol-level error.
    OtherError(String),
    /// Fail the receive with a transport error.
    RecvError,
    /// Park until the RPC token is cancelled, then fail as cancelled.
    Hang,
}

/// One scripted response to a `send_batch` call.
pub enum SendScript {
    /// Fail the send at the transport level.
    Fail,
    /// Open a stream that replays these events, then ends cleanly.
    Stream(Vec<StreamEvent>),
}

/// Transport stub replaying per-address scripts in FIFO order.
///
/// An address with no remaining script serves an empty stream.
#[derive(Default)]
pub struct MockStoreClient {
    scripts: Mutex<HashMap<String, VecDeque<SendScript>>>,
    /// `(addr, region_count)` for every send observed.
    pub sends: Mutex<Vec<(String, usize)>>,
}

impl MockStoreClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, addr: &str, script: SendScript) {
        self.scripts
            .lock()
            .unwrap()
            .entry(addr.to_string())
            .or_default()
            .push_back(script);
    }
}

fn sub_response(event: StreamEvent) -> BatchSubResponse {
    match event {
        StreamEvent::Sub(data) => BatchSubResponse {
            data,
            other_error: None,
        },
        StreamEvent::OtherError(reason) => BatchSubResponse {
            data: Vec::new(),
            other_error: Some(reason),
        },
        StreamEvent::RecvError | StreamEvent::Hang => {
            panic!("recv-error and hang are not valid first stream events")
        }
    }
}

#[async_trait]
impl StoreClient for MockStoreClient {
    async fn send_batch(
        &self,
        cancel: CancellationToken,
        addr: &str,
        req: strata_dispatch::BatchRequest,
        _timeout: Duration,
    ) -> std::result::Result<BatchStreamResponse, TransportError> {
        self.sends
            .lock()
            .unwrap()
            .push((addr.to_string(), req.regions.len()));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(addr)
            .and_then(VecDeque::pop_front)
            .unwrap_or(SendScript::Stream(Vec::new()));
        match script {
            SendScript::Fail => Err(TransportError::Other(anyhow::anyhow!(
                "connection refused: {addr}"
            ))),
            SendScript::Stream(events) => {
                let mut events: VecDeque<StreamEvent> = events.into();
                let first = events.pop_front().map(sub_response);
                Ok(BatchStreamResponse {
                    first,
                    stream: Box::new(MockStream { events, cancel }),
                })
            }
        }
    }
}

struct MockStream {
    events: VecDeque<StreamEvent>,
    cancel: CancellationToken,
}

#[async_trait]
impl BatchStream for MockStream {
    async fn recv(&mut self) -> std::result::Result<Option<BatchSubResponse>, TransportError> {
        match self.events.pop_front() {
            None => Ok(None),
            Some(StreamEvent::RecvError) => {
                Err(TransportError::Other(anyhow::anyhow!("stream reset")))
            }
            Some(StreamEvent::Hang) => {
                self.cancel.cancelled().await;
                Err(TransportError::Cancelled)
            }
            Some(event) => Ok(Some(sub_response(event))),
        }
    }
}
