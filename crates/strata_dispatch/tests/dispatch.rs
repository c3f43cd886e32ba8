//! End-to-end dispatch scenarios over scripted topology and transport mocks.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::{store_addr, MockStoreClient, MockTopology, SendScript, StreamEvent};
use strata_dispatch::{
    BatchResults, BatchStorageClient, DispatchConfig, DispatchError, KeyRange, KeyRanges,
    QueryVars, RequestSpec,
};

const WAIT: Duration = Duration::from_secs(10);

fn full_ranges() -> KeyRanges {
    KeyRanges::new(vec![KeyRange::new(b"a".to_vec(), b"z".to_vec())])
}

async fn run_query(
    client: &BatchStorageClient,
    cancel: CancellationToken,
    vars: Arc<QueryVars>,
) -> BatchResults {
    client
        .batch_query(RequestSpec::default(), full_ranges(), vars, cancel)
        .await
}

#[tokio::test]
async fn single_region_single_store_delivers_payload() {
    let topo = Arc::new(MockTopology::new().with_region(1, b"a", b"z", vec![1]));
    let store = Arc::new(MockStoreClient::new());
    store.script(
        &store_addr(1),
        SendScript::Stream(vec![StreamEvent::Sub(b"payload-x".to_vec())]),
    );
    let client = BatchStorageClient::new(topo, store);

    let mut results = run_query(&client, CancellationToken::new(), Arc::new(QueryVars::new())).await;
    let resp = timeout(WAIT, results.next())
        .await
        .expect("next timed out")
        .expect("unexpected error")
        .expect("expected one response");
    assert_eq!(resp.data(), b"payload-x");
    assert!(resp.start_key().is_empty());
    assert_eq!(resp.stats().callee_addr, store_addr(1));

    let end = timeout(WAIT, results.next())
        .await
        .expect("next timed out")
        .expect("unexpected error");
    assert!(end.is_none());
    results.close().await;
}

#[tokio::test]
async fn two_stores_fan_out_in_arrival_order() {
    let topo = Arc::new(
        MockTopology::new()
            .with_region(1, b"a", b"m", vec![1])
            .with_region(2, b"m", b"z", vec![2]),
    );
    let store = Arc::new(MockStoreClient::new());
    store.script(
        &store_addr(1),
        SendScript::Stream(vec![
            StreamEvent::Sub(b"s1-a".to_vec()),
            StreamEvent::Sub(b"s1-b".to_vec()),
        ]),
    );
    store.script(
        &store_addr(2),
        SendScript::Stream(vec![
            StreamEvent::Sub(b"s2-a".to_vec()),
            StreamEvent::Sub(b"s2-b".to_vec()),
        ]),
    );
    let client = BatchStorageClient::new(topo, store);

    let mut results = run_query(&client, CancellationToken::new(), Arc::new(QueryVars::new())).await;
    let mut payloads = HashSet::new();
    while let Some(resp) = timeout(WAIT, results.next())
        .await
        .expect("next timed out")
        .expect("unexpected error")
    {
        payloads.insert(resp.data().to_vec());
    }
    // Four results total; order across the two streams is unconstrained.
    assert_eq!(payloads.len(), 4);
    for expected in [&b"s1-a"[..], b"s1-b", b"s2-a", b"s2-b"] {
        assert!(payloads.contains(expected));
    }
    results.close().await;
}

#[tokio::test]
async fn close_after_first_result_terminates_workers() {
    let topo = Arc::new(
        MockTopology::new()
            .with_region(1, b"a", b"m", vec![1])
            .with_region(2, b"m", b"z", vec![2]),
    );
    let store = Arc::new(MockStoreClient::new());
    for s in [1, 2] {
        store.script(
            &store_addr(s),
            SendScript::Stream(vec![
                StreamEvent::Sub(vec![s as u8]),
                StreamEvent::Sub(vec![s as u8, 2]),
            ]),
        );
    }
    let client = BatchStorageClient::new(topo, store);

    let mut results = run_query(&client, CancellationToken::new(), Arc::new(QueryVars::new())).await;
    let first = timeout(WAIT, results.next())
        .await
        .expect("next timed out")
        .expect("unexpected error");
    assert!(first.is_some());
    timeout(WAIT, results.close()).await.expect("close timed out");
}

#[tokio::test]
async fn region_miss_backs_off_once_then_plan_succeeds() {
    let topo = Arc::new(
        MockTopology::new()
            .with_region(1, b"a", b"z", vec![1])
            .with_misses(1, 1),
    );
    let store = Arc::new(MockStoreClient::new());
    store.script(
        &store_addr(1),
        SendScript::Stream(vec![StreamEvent::Sub(b"after-miss".to_vec())]),
    );
    let client = BatchStorageClient::new(topo, store);

    let mut results = run_query(&client, CancellationToken::new(), Arc::new(QueryVars::new())).await;
    let resp = timeout(WAIT, results.next())
        .await
        .expect("next timed out")
        .expect("unexpected error")
        .expect("expected one response");
    assert_eq!(resp.data(), b"after-miss");
    // One failed pass, one region-miss backoff, then a complete plan.
    let snap = client.metrics();
    assert_eq!(snap.plan_region_miss_retries, 1);
    assert_eq!(snap.plans_built, 1);
    results.close().await;
}

#[tokio::test]
async fn transient_send_failure_replans_merged_ranges() {
    let topo = Arc::new(
        MockTopology::new()
            .with_region(1, b"a", b"m", vec![1, 2])
            .with_region(2, b"m", b"z", vec![1, 2]),
    );
    let store = Arc::new(MockStoreClient::new());
    store.script(&store_addr(1), SendScript::Fail);
    store.script(
        &store_addr(1),
        SendScript::Stream(vec![StreamEvent::Sub(b"second-try".to_vec())]),
    );
    let client = BatchStorageClient::new(topo.clone(), store.clone());

    let mut results = run_query(&client, CancellationToken::new(), Arc::new(QueryVars::new())).await;
    let resp = timeout(WAIT, results.next())
        .await
        .expect("next timed out")
        .expect("unexpected error")
        .expect("expected one response");
    assert_eq!(resp.data(), b"second-try");
    // The worker re-planned with the union of both regions' ranges, so the
    // second send carries both regions again.
    let sends = store.sends.lock().unwrap().clone();
    assert_eq!(sends, vec![(store_addr(1), 2), (store_addr(1), 2)]);
    // The topology cache saw exactly one failure notification for the store.
    assert_eq!(*topo.send_failures.lock().unwrap(), vec![(1, 2)]);
    assert_eq!(client.metrics().send_retries, 1);
    results.close().await;
}

#[tokio::test]
async fn cancellation_unblocks_next_and_close() {
    let topo = Arc::new(MockTopology::new().with_region(1, b"a", b"z", vec![1]));
    let store = Arc::new(MockStoreClient::new());
    store.script(
        &store_addr(1),
        SendScript::Stream(vec![StreamEvent::Sub(b"mid-flight".to_vec()), StreamEvent::Hang]),
    );
    let client = BatchStorageClient::new(topo, store);

    let cancel = CancellationToken::new();
    let mut results = run_query(&client, cancel.clone(), Arc::new(QueryVars::new())).await;
    let first = timeout(WAIT, results.next())
        .await
        .expect("next timed out")
        .expect("unexpected error");
    assert!(first.is_some());

    cancel.cancel();
    let end = timeout(WAIT, results.next())
        .await
        .expect("next did not observe cancellation")
        .expect("cancellation must not surface as an error");
    assert!(end.is_none());
    timeout(WAIT, results.close())
        .await
        .expect("workers did not terminate after cancellation");
}

#[tokio::test]
async fn keep_order_is_rejected_on_first_next() {
    let topo = Arc::new(MockTopology::new().with_region(1, b"a", b"z", vec![1]));
    let store = Arc::new(MockStoreClient::new());
    let client = BatchStorageClient::new(topo, store);

    let spec = RequestSpec {
        keep_order: true,
        ..RequestSpec::default()
    };
    let mut results = client
        .batch_query(
            spec,
            full_ranges(),
            Arc::new(QueryVars::new()),
            CancellationToken::new(),
        )
        .await;
    let err = results.next().await.unwrap_err();
    assert!(matches!(err, DispatchError::OrderUnsupported));
    assert!(results.next().await.unwrap().is_none());
    results.close().await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let topo = Arc::new(MockTopology::new().with_region(1, b"a", b"z", vec![1]));
    let store = Arc::new(MockStoreClient::new());
    store.script(
        &store_addr(1),
        SendScript::Stream(vec![StreamEvent::Sub(b"x".to_vec())]),
    );
    let client = BatchStorageClient::new(topo, store);

    let mut results = run_query(&client, CancellationToken::new(), Arc::new(QueryVars::new())).await;
    timeout(WAIT, results.close()).await.expect("first close");
    timeout(WAIT, results.close()).await.expect("second close");
}

#[tokio::test]
async fn stream_error_surfaces_once_after_successes() {
    let topo = Arc::new(MockTopology::new().with_region(1, b"a", b"z", vec![1]));
    let store = Arc::new(MockStoreClient::new());
    store.script(
        &store_addr(1),
        SendScript::Stream(vec![
            StreamEvent::Sub(b"one".to_vec()),
            StreamEvent::Sub(b"two".to_vec()),
            StreamEvent::Sub(b"three".to_vec()),
            StreamEvent::RecvError,
        ]),
    );
    let client = BatchStorageClient::new(topo, store);

    let mut results = run_query(&client, CancellationToken::new(), Arc::new(QueryVars::new())).await;
    for expected in [&b"one"[..], b"two", b"three"] {
        let resp = timeout(WAIT, results.next())
            .await
            .expect("next timed out")
            .expect("unexpected error")
            .expect("expected a response");
        assert_eq!(resp.data(), expected);
    }
    let err = timeout(WAIT, results.next())
        .await
        .expect("next timed out")
        .unwrap_err();
    assert!(matches!(err, DispatchError::ServerTimeout { .. }));
    // The failed task is not reissued: the queue closes after the error.
    let end = timeout(WAIT, results.next())
        .await
        .expect("next timed out")
        .expect("unexpected error");
    assert!(end.is_none());
    assert_eq!(client.metrics().stream_errors, 1);
    results.close().await;
}

#[tokio::test]
async fn killed_query_interrupts_next() {
    let topo = Arc::new(MockTopology::new().with_region(1, b"a", b"z", vec![1]));
    let store = Arc::new(MockStoreClient::new());
    store.script(
        &store_addr(1),
        SendScript::Stream(vec![StreamEvent::Sub(b"x".to_vec()), StreamEvent::Hang]),
    );
    let client = BatchStorageClient::new(topo, store).with_config(DispatchConfig {
        kill_check_interval: Duration::from_millis(50),
        ..DispatchConfig::default()
    });

    let vars = Arc::new(QueryVars::new());
    let mut results = run_query(&client, CancellationToken::new(), vars.clone()).await;
    let first = timeout(WAIT, results.next())
        .await
        .expect("next timed out")
        .expect("unexpected error");
    assert!(first.is_some());

    vars.kill();
    let err = timeout(WAIT, results.next())
        .await
        .expect("kill flag was not observed")
        .unwrap_err();
    assert!(matches!(err, DispatchError::QueryInterrupted));
    timeout(WAIT, results.close()).await.expect("close timed out");
}

#[tokio::test]
async fn shutdown_fails_query_without_retry() {
    let topo = Arc::new(MockTopology::new().with_region(1, b"a", b"z", vec![1]));
    let store = Arc::new(MockStoreClient::new());
    store.script(&store_addr(1), SendScript::Fail);
    let client = BatchStorageClient::new(topo.clone(), store);
    client.shutdown();

    let mut results = run_query(&client, CancellationToken::new(), Arc::new(QueryVars::new())).await;
    let err = timeout(WAIT, results.next())
        .await
        .expect("next timed out")
        .unwrap_err();
    assert!(matches!(err, DispatchError::ShuttingDown));
    // Shutdown short-circuits before the topology cache is notified.
    assert!(topo.send_failures.lock().unwrap().is_empty());
    results.close().await;
}
