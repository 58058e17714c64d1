//! Stress tests: many in-flight requests, closes and timeouts under load.
//!
//! Tests verify that every outbound request settles exactly once, that
//! message ids are never reused, and that bulk notifications coalesce.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::{json, Value};

use monologue_mcp::protocol::{
    NotificationOptions, Protocol, ProtocolOptions, RequestHandlerExtra, RequestOptions,
};
use monologue_mcp::types::{JsonRpcNotification, JsonRpcRequest, McpError, RequestId};
use monologue_mcp::InMemoryTransport;

// ─── Helpers ───────────────────────────────────────────────────────────────

async fn linked(a: &Protocol, b: &Protocol) {
    let (left, right) = InMemoryTransport::create_linked_pair();
    a.connect(left).await.expect("connect a");
    b.connect(right).await.expect("connect b");
}

/// Never answers on its own; counts how many times the peer cancelled it.
fn parked_engine(cancellations: Arc<AtomicUsize>) -> Protocol {
    let engine = Protocol::new(ProtocolOptions::default());
    engine
        .set_request_handler_raw(
            "test/park",
            Arc::new(move |_request: JsonRpcRequest, extra: RequestHandlerExtra| {
                let cancellations = cancellations.clone();
                async move {
                    extra.signal.aborted().await;
                    cancellations.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
                .boxed()
            }),
        )
        .expect("register park");
    engine
}

// ─── Tests ─────────────────────────────────────────────────────────────────

/// 500 concurrent requests, answered out of order, each settles once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_requests_settle_exactly_once() {
    let seen_ids = Arc::new(Mutex::new(HashSet::new()));
    let ids = seen_ids.clone();

    let client = Protocol::new(ProtocolOptions::default());
    let server = Protocol::new(ProtocolOptions::default());
    server
        .set_request_handler_raw(
            "test/square",
            Arc::new(move |request: JsonRpcRequest, _extra: RequestHandlerExtra| {
                ids.lock().unwrap().insert(request.id.clone());
                let n = request
                    .params
                    .as_ref()
                    .and_then(|params| params["n"].as_u64())
                    .unwrap_or_default();
                async move {
                    tokio::time::sleep(Duration::from_millis(n % 7)).await;
                    Ok(json!({"square": n * n}))
                }
                .boxed()
            }),
        )
        .expect("register square");
    linked(&client, &server).await;

    let start = Instant::now();
    let mut handles = Vec::with_capacity(500);
    for n in 0..500u64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let reply = client
                .request_raw("test/square", Some(json!({"n": n})), RequestOptions::default())
                .await
                .expect("square");
            assert_eq!(reply["square"], n * n);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let seen_ids = seen_ids.lock().unwrap();
    assert_eq!(seen_ids.len(), 500, "message ids must never repeat");
    assert!(seen_ids.contains(&RequestId::Number(0)));
    assert!(seen_ids.contains(&RequestId::Number(499)));
    assert_eq!(client.pending_request_count(), 0);
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "500 requests took {:?}",
        start.elapsed()
    );
}

/// Closing with 100 requests in flight rejects all of them.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_under_load() {
    let client = Protocol::new(ProtocolOptions::default());
    let server = parked_engine(Arc::new(AtomicUsize::new(0)));
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    server.set_on_close(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    linked(&client, &server).await;

    let mut handles = Vec::with_capacity(100);
    for _ in 0..100 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client
                .request_raw("test/park", None, RequestOptions::default())
                .await
        }));
    }
    while client.pending_request_count() < 100 {
        tokio::task::yield_now().await;
    }

    client.close().await.expect("close");
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed), "got {err}");
    }
    assert_eq!(client.pending_request_count(), 0);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(!server.is_connected());
}

/// Every timed-out request cancels its handler on the peer.
#[tokio::test(start_paused = true)]
async fn test_timeouts_under_load() {
    let cancellations = Arc::new(AtomicUsize::new(0));
    let client = Protocol::new(ProtocolOptions::default());
    let server = parked_engine(cancellations.clone());
    linked(&client, &server).await;

    let mut handles = Vec::with_capacity(50);
    for i in 0..50u64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client
                .request_raw(
                    "test/park",
                    None,
                    RequestOptions::default().with_timeout(Duration::from_millis(10 + i)),
                )
                .await
        }));
    }
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.code(), -32001);
    }

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(cancellations.load(Ordering::SeqCst), 50);
    assert_eq!(client.pending_request_count(), 0);
}

/// A burst of list-changed notifications reaches the peer once.
#[tokio::test]
async fn test_notification_burst_coalesces() {
    const METHOD: &str = "notifications/tools/list_changed";
    let sender = Protocol::new(ProtocolOptions {
        debounced_notification_methods: vec![METHOD.to_string()],
        ..ProtocolOptions::default()
    });
    let receiver = Protocol::new(ProtocolOptions::default());
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    receiver.set_notification_handler_raw(
        METHOD,
        Arc::new(move |_notification: JsonRpcNotification| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        }),
    );
    linked(&sender, &receiver).await;

    for _ in 0..1000 {
        sender
            .notification_raw(METHOD, None, NotificationOptions::default())
            .await
            .expect("notify");
    }
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(received.load(Ordering::SeqCst), 1);

    // The next burst, after the first flushed, is delivered again.
    sender
        .notification_raw(METHOD, None, NotificationOptions::default())
        .await
        .expect("notify");
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(received.load(Ordering::SeqCst), 2);
}
