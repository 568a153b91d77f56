use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use httpmock::prelude::*;
use serde_json::json;

use crate::{
    graphql::GraphqlProvider, poll_block, poll_transactions, stats::WindowStats, BlockHeader,
    PollContext, PollObserver, PollTarget, Poller, PollerError, PollerOptions, TransactionWindow,
};

fn block_json(height: u64) -> serde_json::Value {
    json!({
        "height": height,
        "version": "1.0.0",
        "chain_id": "test3",
        "time": "2024-05-01T12:00:00Z",
        "proposer_address_raw": "g1proposer",
    })
}

fn bank_send_json(block: u64, hash: &str) -> serde_json::Value {
    json!({
        "block_height": block,
        "hash": hash,
        "messages": [{ "route": "bank", "typeUrl": "send", "value": {
            "__typename": "BankMsgSend", "from_address": "x", "to_address": "y", "amount": "5",
        } }],
    })
}

async fn mock_blocks<'a>(server: &'a MockServer, heights: &[u64]) -> httpmock::Mock<'a> {
    let blocks = heights.iter().map(|height| block_json(*height)).collect::<Vec<_>>();
    server
        .mock_async(|when, then| {
            when.method(POST).body_contains("blocks(filter");
            then.status(200)
                .json_body(json!({ "data": { "blocks": blocks } }));
        })
        .await
}

async fn with_block(context: &PollContext<()>, server: &MockServer, height: u64) {
    let mock = mock_blocks(server, &[height]).await;
    poll_block(
        &GraphqlProvider::with_endpoint(server.url("/")),
        context,
        context.state.next_block_sequence(),
    )
    .await;
    mock.delete_async().await;
    assert_eq!(context.state.current_height(), Some(height));
}

#[tokio::test]
async fn uses_last_block_of_response() {
    let server = MockServer::start_async().await;
    mock_blocks(&server, &[40, 41, 42]).await;
    let context = PollContext::new((), PollerOptions::default());
    let provider = GraphqlProvider::with_endpoint(server.url("/"));

    poll_block(&provider, &context, context.state.next_block_sequence()).await;

    let block = context.state.current_block().unwrap();
    assert_eq!(block.number, 42);
    assert_eq!(block.id, "test3");
}

#[tokio::test]
async fn empty_block_response_keeps_previous_block() {
    let server = MockServer::start_async().await;
    let context = PollContext::new((), PollerOptions::default());
    with_block(&context, &server, 5).await;

    mock_blocks(&server, &[]).await;
    let provider = GraphqlProvider::with_endpoint(server.url("/"));
    poll_block(&provider, &context, context.state.next_block_sequence()).await;

    assert_eq!(context.state.current_height(), Some(5));
    assert_eq!(context.state.failure_count(), 0);
}

#[tokio::test]
async fn failed_block_poll_is_recorded() {
    let server = MockServer::start_async().await;
    let context = PollContext::new((), PollerOptions::default());
    with_block(&context, &server, 5).await;

    server
        .mock_async(|when, then| {
            when.method(POST);
            then.status(200).body("{\"data\":");
        })
        .await;
    let provider = GraphqlProvider::with_endpoint(server.url("/"));
    poll_block(&provider, &context, context.state.next_block_sequence()).await;

    assert_eq!(context.state.current_height(), Some(5));
    assert_eq!(context.state.failure_count(), 1);
    assert_eq!(
        context.state.last_failure().unwrap().target,
        PollTarget::Block
    );
}

#[tokio::test]
async fn unreachable_server_is_recorded() {
    let context = PollContext::new((), PollerOptions::default());
    // Nothing listens on port 9 (discard) on test machines
    let provider = GraphqlProvider::with_endpoint("http://127.0.0.1:9/graphql/query".to_string());
    poll_block(&provider, &context, context.state.next_block_sequence()).await;
    assert!(context.state.current_block().is_none());
    assert_eq!(context.state.failure_count(), 1);
}

#[tokio::test]
async fn slow_block_response_is_discarded() {
    let server = MockServer::start_async().await;
    mock_blocks(&server, &[9]).await;
    let context = PollContext::new((), PollerOptions::default());
    let provider = GraphqlProvider::with_endpoint(server.url("/"));

    let slow = context.state.next_block_sequence();
    let fast = context.state.next_block_sequence();
    poll_block(&provider, &context, fast).await;
    let applied = context.state.current_block().unwrap();
    poll_block(&provider, &context, slow).await;

    assert!(Arc::ptr_eq(&applied, &context.state.current_block().unwrap()));
}

#[tokio::test]
async fn transactions_wait_for_first_block() {
    let server = MockServer::start_async().await;
    let transactions = server
        .mock_async(|when, then| {
            when.method(POST);
            then.status(200)
                .json_body(json!({ "data": { "transactions": [] } }));
        })
        .await;
    let context = PollContext::new((), PollerOptions::default());
    let provider = GraphqlProvider::with_endpoint(server.url("/"));

    poll_transactions(&provider, &context, context.state.next_window_sequence()).await;

    transactions.assert_hits_async(0).await;
    assert!(context.state.current_window().is_none());
}

#[tokio::test]
async fn fetches_trailing_window() {
    let server = MockServer::start_async().await;
    let context = PollContext::new((), PollerOptions::default());
    with_block(&context, &server, 150).await;

    let transactions = server
        .mock_async(|when, then| {
            when.method(POST).body_contains("from_block_height: 51");
            then.status(200).json_body(json!({ "data": { "transactions": [
                bank_send_json(10, "a"),
                bank_send_json(150, "b"),
            ] } }));
        })
        .await;
    let provider = GraphqlProvider::with_endpoint(server.url("/"));
    poll_transactions(&provider, &context, context.state.next_window_sequence()).await;

    transactions.assert_async().await;
    let window = context.state.current_window().unwrap();
    assert_eq!(window.from_height, 51);
    assert_eq!(window.to_height, 150);
    assert_eq!(
        serde_json::to_value(&window.transactions).unwrap(),
        json!([
            { "block": 150, "hash": "b", "sender": "x",
              "extrinsic": { "name": "BankMsgSend", "value": { "from": "x", "to": "y", "amount": "5" } } },
            { "block": 10, "hash": "a", "sender": "x",
              "extrinsic": { "name": "BankMsgSend", "value": { "from": "x", "to": "y", "amount": "5" } } },
        ])
    );
}

#[tokio::test]
async fn window_starts_at_first_block_on_young_chains() {
    let server = MockServer::start_async().await;
    let context = PollContext::new((), PollerOptions::default());
    with_block(&context, &server, 10).await;

    let transactions = server
        .mock_async(|when, then| {
            when.method(POST).body_contains("from_block_height: 1 }");
            then.status(200).json_body(json!({ "data": { "transactions": [
                bank_send_json(10, "a"),
            ] } }));
        })
        .await;
    let provider = GraphqlProvider::with_endpoint(server.url("/"));
    poll_transactions(&provider, &context, context.state.next_window_sequence()).await;

    transactions.assert_async().await;
    let window = context.state.current_window().unwrap();
    assert_eq!(window.from_height, 1);
    assert_eq!(
        serde_json::to_value(&window.transactions).unwrap(),
        json!([{ "block": 10, "hash": "a", "sender": "x",
                 "extrinsic": { "name": "BankMsgSend", "value": { "from": "x", "to": "y", "amount": "5" } } }])
    );
}

#[tokio::test]
async fn failed_transaction_poll_keeps_window() {
    let server = MockServer::start_async().await;
    let context = PollContext::new((), PollerOptions::default());
    with_block(&context, &server, 20).await;

    let transactions = server
        .mock_async(|when, then| {
            when.method(POST);
            then.status(200).json_body(json!({ "data": { "transactions": [
                bank_send_json(20, "a"),
            ] } }));
        })
        .await;
    let provider = GraphqlProvider::with_endpoint(server.url("/"));
    poll_transactions(&provider, &context, context.state.next_window_sequence()).await;
    let window = context.state.current_window().unwrap();
    transactions.delete_async().await;

    server
        .mock_async(|when, then| {
            when.method(POST);
            then.status(200)
                .json_body(json!({ "data": null, "errors": [{ "message": "boom" }] }));
        })
        .await;
    poll_transactions(&provider, &context, context.state.next_window_sequence()).await;

    assert!(Arc::ptr_eq(&window, &context.state.current_window().unwrap()));
    let failure = context.state.last_failure().unwrap();
    assert_eq!(failure.target, PollTarget::Transactions);
    assert!(failure.message.contains("boom"));
}

#[derive(Default)]
struct CountingObserver {
    blocks: Arc<AtomicUsize>,
    windows: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl PollObserver for CountingObserver {
    type Error = String;

    async fn on_block(&self, _block: &BlockHeader) -> Result<(), Self::Error> {
        self.blocks.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err("observer gave up".to_string())
        } else {
            Ok(())
        }
    }

    async fn on_window(
        &self,
        window: &TransactionWindow,
        stats: &WindowStats,
    ) -> Result<(), Self::Error> {
        assert_eq!(stats.transaction_count, window.transactions.len());
        self.windows.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn fast_options() -> PollerOptions {
    PollerOptions {
        block_poll_interval: Duration::from_millis(20),
        transaction_poll_interval: Duration::from_millis(20),
        ctrl_c_handler: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn poller_fills_both_slots() {
    let server = MockServer::start_async().await;
    mock_blocks(&server, &[3]).await;
    server
        .mock_async(|when, then| {
            when.method(POST).body_contains("from_block_height: 1 }");
            then.status(200).json_body(json!({ "data": { "transactions": [
                bank_send_json(2, "a"),
                bank_send_json(3, "b"),
            ] } }));
        })
        .await;

    let observer = CountingObserver::default();
    let blocks_seen = Arc::clone(&observer.blocks);
    let windows_seen = Arc::clone(&observer.windows);
    let provider = GraphqlProvider::with_endpoint(server.url("/"));
    let poller = Poller::start(provider.clone(), provider, observer, fast_options());
    let state = poller.state();

    tokio::time::timeout(Duration::from_secs(10), async {
        while state.current_window().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    poller.shutdown().await.unwrap();

    assert_eq!(state.current_height(), Some(3));
    let window = state.current_window().unwrap();
    assert_eq!(window.stats().transaction_count, 2);
    assert_eq!(window.transactions[0].hash, "b");
    // Same block every tick, so only the first one is new
    assert_eq!(blocks_seen.load(Ordering::SeqCst), 1);
    assert!(windows_seen.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn poller_survives_failing_server() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST);
            then.status(500).body("internal error");
        })
        .await;

    let provider = GraphqlProvider::with_endpoint(server.url("/"));
    let poller = Poller::start(provider.clone(), provider, (), fast_options());
    let state = poller.state();

    tokio::time::timeout(Duration::from_secs(10), async {
        while state.failure_count() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    poller.shutdown().await.unwrap();
    assert!(state.current_block().is_none());
}

#[tokio::test]
async fn observer_error_stops_poller() {
    let server = MockServer::start_async().await;
    mock_blocks(&server, &[3]).await;

    let observer = CountingObserver {
        fail: true,
        ..Default::default()
    };
    let provider = GraphqlProvider::with_endpoint(server.url("/"));
    let poller = Poller::start(
        provider.clone(),
        provider,
        observer,
        PollerOptions {
            stop_on_error: true,
            ..fast_options()
        },
    );

    tokio::time::timeout(Duration::from_secs(10), poller.stopped())
        .await
        .unwrap();
    match poller.shutdown().await {
        Err(PollerError::Observer(message)) => assert_eq!(message, "observer gave up"),
        other => panic!("Expected an observer error, got {other:?}"),
    }
}

#[tokio::test]
async fn run_poller_returns_observer_error() {
    let server = MockServer::start_async().await;
    mock_blocks(&server, &[3]).await;

    let provider = GraphqlProvider::with_endpoint(server.url("/"));
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        crate::run_poller(
            provider.clone(),
            provider,
            CountingObserver {
                fail: true,
                ..Default::default()
            },
            PollerOptions {
                stop_on_error: true,
                ..fast_options()
            },
        ),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(PollerError::Observer(_))));
}

// base64 of newline-delimited blocks 7 and 8, and of block 9 alone
#[cfg(feature = "jsonrpc-filter")]
const BLOCKS_7_8: &str = "eyJoZWlnaHQiOjcsInZlcnNpb24iOiIxLjAuMCIsImNoYWluX2lkIjoidGVzdDMiLCJ0aW1lIjoiMjAyNC0wNS0wMVQxMjowMDowMFoiLCJwcm9wb3Nlcl9hZGRyZXNzX3JhdyI6ImcxYSJ9CnsiaGVpZ2h0Ijo4LCJ2ZXJzaW9uIjoiMS4wLjAiLCJjaGFpbl9pZCI6InRlc3QzIiwidGltZSI6IjIwMjQtMDUtMDFUMTI6MDA6MDVaIiwicHJvcG9zZXJfYWRkcmVzc19yYXciOiJnMWIifQo=";
#[cfg(feature = "jsonrpc-filter")]
const BLOCK_9: &str = "eyJoZWlnaHQiOjksInZlcnNpb24iOiIxLjAuMCIsImNoYWluX2lkIjoidGVzdDMiLCJ0aW1lIjoiMjAyNC0wNS0wMVQxMjowMDoxMFoiLCJwcm9wb3Nlcl9hZGRyZXNzX3JhdyI6ImcxYyJ9Cg==";

#[cfg(feature = "jsonrpc-filter")]
async fn mock_new_filter(server: &MockServer) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(POST).body_contains("newBlockFilter");
            then.status(200)
                .json_body(json!({ "jsonrpc": "2.0", "id": 1, "result": "filter-1" }));
        })
        .await
}

#[cfg(feature = "jsonrpc-filter")]
async fn mock_filter_changes<'a>(server: &'a MockServer, payloads: &[&str]) -> httpmock::Mock<'a> {
    let payloads = payloads.to_vec();
    server
        .mock_async(|when, then| {
            when.method(POST)
                .body_contains("getFilterChanges")
                .body_contains("filter-1");
            then.status(200)
                .json_body(json!({ "jsonrpc": "2.0", "id": 2, "result": payloads }));
        })
        .await
}

#[cfg(feature = "jsonrpc-filter")]
#[tokio::test]
async fn filter_source_keeps_block_between_changes() {
    use crate::jsonrpc_filter::JsonRpcFilterProvider;

    let server = MockServer::start_async().await;
    let new_filter = mock_new_filter(&server).await;
    let observer = CountingObserver::default();
    let blocks_seen = Arc::clone(&observer.blocks);
    let context = PollContext::new(observer, PollerOptions::default());
    let provider = JsonRpcFilterProvider::with_endpoint(server.url("/"));

    let changes = mock_filter_changes(&server, &[BLOCKS_7_8]).await;
    poll_block(&provider, &context, context.state.next_block_sequence()).await;
    assert_eq!(context.state.current_height(), Some(8));
    changes.delete_async().await;

    // Nothing new since the last call
    let changes = mock_filter_changes(&server, &[]).await;
    poll_block(&provider, &context, context.state.next_block_sequence()).await;
    changes.assert_async().await;
    assert_eq!(context.state.current_height(), Some(8));
    assert_eq!(context.state.failure_count(), 0);
    changes.delete_async().await;

    mock_filter_changes(&server, &[BLOCK_9]).await;
    poll_block(&provider, &context, context.state.next_block_sequence()).await;
    let block = context.state.current_block().unwrap();
    assert_eq!(block.number, 9);
    assert_eq!(block.proposer, "g1c");

    new_filter.assert_hits_async(1).await;
    assert_eq!(blocks_seen.load(Ordering::SeqCst), 2);
    assert_eq!(context.state.failure_count(), 0);
}

#[cfg(feature = "jsonrpc-filter")]
#[tokio::test]
async fn poller_with_filter_blocks_and_graphql_transactions() {
    use crate::jsonrpc_filter::JsonRpcFilterProvider;

    let server = MockServer::start_async().await;
    mock_new_filter(&server).await;
    mock_filter_changes(&server, &[BLOCKS_7_8]).await;
    server
        .mock_async(|when, then| {
            when.method(POST).body_contains("from_block_height: 1 }");
            then.status(200).json_body(json!({ "data": { "transactions": [
                bank_send_json(7, "a"),
                bank_send_json(8, "b"),
            ] } }));
        })
        .await;

    let poller = Poller::start(
        JsonRpcFilterProvider::with_endpoint(server.url("/")),
        GraphqlProvider::with_endpoint(server.url("/")),
        (),
        fast_options(),
    );
    let state = poller.state();

    tokio::time::timeout(Duration::from_secs(10), async {
        while state.current_window().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    poller.shutdown().await.unwrap();

    assert_eq!(state.current_height(), Some(8));
    let window = state.current_window().unwrap();
    assert_eq!(window.to_height, 8);
    assert_eq!(window.transactions[0].hash, "b");
}
