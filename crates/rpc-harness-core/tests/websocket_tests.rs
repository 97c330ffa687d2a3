//! WebSocket endpoint tests.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};

use rpc_harness_core::error::{HarnessError, RpcError};
use rpc_harness_core::testing::init_tracing;
use rpc_harness_core::wire::ServerFrame;
use rpc_harness_core::{Harness, RemoteError, ServiceContainer, ServiceDefinition, TestScope};

fn ws_service() -> ServiceDefinition {
    ServiceDefinition::new("ws")
        .websocket_rpc("uppercase", |_ctx, data| async move {
            let value = data["arg"]
                .as_str()
                .ok_or_else(|| RemoteError::new("TypeError", "arg must be a string"))?;
            Ok(json!(value.to_uppercase()))
        })
        .websocket_rpc("slow_echo", |_ctx, data| async move {
            let delay = data["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(data["value"].clone())
        })
        .websocket_rpc("announce", |ctx, data| async move {
            let reached = ctx.websocket_hub().broadcast("announcement", data);
            Ok(json!(reached))
        })
        .websocket_rpc("whoami", |ctx, _data| async move { Ok(json!(ctx.socket_id())) })
        .websocket_rpc("whisper", |ctx, data| async move {
            let to = data["to"].as_str().unwrap_or_default();
            Ok(json!(ctx.websocket_hub().unicast(to, "whisper", data["text"].clone())))
        })
}

async fn started(scope: &TestScope) -> Arc<ServiceContainer> {
    let container = scope.container(ws_service(), scope.web_config().await.unwrap()).unwrap();
    container.start().await.unwrap();
    container
}

async fn wait_until_released(container: &ServiceContainer, socket_id: &str) {
    let hub = container.websocket_hub();
    for _ in 0..100 {
        if !hub.contains(socket_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socket {socket_id} still registered");
}

// ============================================================================
// Calls
// ============================================================================

#[tokio::test]
async fn test_websocket_rpc_returns_result() {
    init_tracing();
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    let container = started(&scope).await;

    let handle = scope.websocket_client(&container).unwrap().connect().await.unwrap();
    assert!(container.websocket_hub().contains(handle.socket_id()));

    let result = handle.rpc("uppercase", json!({ "arg": "foo" })).await.unwrap();
    assert_eq!(result, json!("FOO"));

    let whoami = handle.rpc("whoami", json!({})).await.unwrap();
    assert_eq!(whoami, json!(handle.socket_id()));

    scope.teardown().await.unwrap();
}

/// Results are matched by correlation id, not arrival order.
#[tokio::test]
async fn test_concurrent_calls_on_one_socket() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    let container = started(&scope).await;
    let handle = scope.websocket_client(&container).unwrap().connect().await.unwrap();

    let calls = (0..5u64).map(|i| {
        let handle = handle.clone();
        async move {
            let delay = (5 - i) * 20;
            handle
                .rpc("slow_echo", json!({ "value": i, "delay_ms": delay }))
                .await
        }
    });
    let results: Vec<Value> = join_all(calls).await.into_iter().map(Result::unwrap).collect();
    assert_eq!(results, (0..5u64).map(|i| json!(i)).collect::<Vec<_>>());
    assert!(handle.drain_unmatched().is_empty());

    scope.teardown().await.unwrap();
}

#[tokio::test]
async fn test_handler_error_is_surfaced() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    let container = started(&scope).await;
    let handle = scope.websocket_client(&container).unwrap().connect().await.unwrap();

    let err = handle.rpc("uppercase", json!({ "arg": 3 })).await.unwrap_err();
    let remote = err.remote().expect("remote error");
    assert_eq!(remote.exc_type, "TypeError");
    assert_eq!(remote.message, "arg must be a string");

    // The socket stays usable.
    assert_eq!(
        handle.rpc("uppercase", json!({ "arg": "ok" })).await.unwrap(),
        json!("OK")
    );

    scope.teardown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_method_is_reported() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    let container = started(&scope).await;
    let handle = scope.websocket_client(&container).unwrap().connect().await.unwrap();

    let err = handle.rpc("nope", json!({})).await.unwrap_err();
    assert_eq!(err.remote().map(|r| r.exc_type.as_str()), Some("MethodNotFound"));

    scope.teardown().await.unwrap();
}

#[tokio::test]
async fn test_rpc_timeout() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    let container = started(&scope).await;
    let handle = scope
        .websocket_client(&container)
        .unwrap()
        .with_rpc_timeout(Duration::from_millis(50))
        .connect()
        .await
        .unwrap();

    let err = handle
        .rpc("slow_echo", json!({ "value": 1, "delay_ms": 500 }))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // The late result is kept for inspection.
    let frame = handle.next_frame(Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame.into_outcome(), Some(Ok(json!(1))));

    scope.teardown().await.unwrap();
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_broadcast_reaches_every_socket() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    let container = started(&scope).await;
    let client = scope.websocket_client(&container).unwrap();
    let first = client.connect().await.unwrap();
    let second = client.connect().await.unwrap();
    assert_ne!(first.socket_id(), second.socket_id());

    let reached = first.rpc("announce", json!({ "text": "hello" })).await.unwrap();
    assert_eq!(reached, json!(2));

    for handle in [&first, &second] {
        let frame = handle.next_frame(Duration::from_secs(2)).await.unwrap();
        match frame {
            ServerFrame::Event { event, data } => {
                assert_eq!(event, "announcement");
                assert_eq!(data, json!({ "text": "hello" }));
            }
            other => panic!("expected an event, got {other:?}"),
        }
    }

    scope.teardown().await.unwrap();
}

#[tokio::test]
async fn test_unicast_reaches_only_the_addressed_socket() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    let container = started(&scope).await;
    let client = scope.websocket_client(&container).unwrap();
    let sender = client.connect().await.unwrap();
    let receiver = client.connect().await.unwrap();

    let reached = sender
        .rpc("whisper", json!({ "to": receiver.socket_id(), "text": "psst" }))
        .await
        .unwrap();
    assert_eq!(reached, json!(true));

    match receiver.next_frame(Duration::from_secs(2)).await.unwrap() {
        ServerFrame::Event { event, data } => {
            assert_eq!(event, "whisper");
            assert_eq!(data, json!("psst"));
        }
        other => panic!("expected an event, got {other:?}"),
    }
    assert!(sender.next_frame(Duration::from_millis(50)).await.unwrap_err().is_timeout());

    let missed = sender
        .rpc("whisper", json!({ "to": "no-such-socket", "text": "psst" }))
        .await
        .unwrap();
    assert_eq!(missed, json!(false));

    scope.teardown().await.unwrap();
}

#[tokio::test]
async fn test_next_frame_times_out_when_idle() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    let container = started(&scope).await;
    let handle = scope.websocket_client(&container).unwrap().connect().await.unwrap();

    let err = handle.next_frame(Duration::from_millis(50)).await.unwrap_err();
    assert!(err.is_timeout());

    scope.teardown().await.unwrap();
}

// ============================================================================
// Closing
// ============================================================================

#[tokio::test]
async fn test_close_releases_socket_id() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    let container = started(&scope).await;
    let handle = scope.websocket_client(&container).unwrap().connect().await.unwrap();
    let socket_id = handle.socket_id().to_string();

    handle.close().await.unwrap();
    handle.close().await.unwrap();
    assert!(handle.is_closed());
    wait_until_released(&container, &socket_id).await;

    let err = handle.rpc("uppercase", json!({ "arg": "x" })).await.unwrap_err();
    assert!(matches!(err, HarnessError::Rpc(RpcError::Disconnected)));

    scope.teardown().await.unwrap();
}

#[tokio::test]
async fn test_teardown_closes_open_sockets() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    let container = started(&scope).await;
    let handle = scope.websocket_client(&container).unwrap().connect().await.unwrap();
    let socket_id = handle.socket_id().to_string();

    let report = scope.teardown_report().await;
    assert!(report.is_clean(), "{:?}", report.failures);
    assert!(report
        .completed
        .iter()
        .any(|label| label == &format!("websocket {socket_id}")));

    assert!(handle.is_closed());
    assert!(!container.websocket_hub().contains(&socket_id));
}

#[tokio::test]
async fn test_connect_after_stop_fails() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    let container = started(&scope).await;
    let client = scope.websocket_client(&container).unwrap();
    container.stop().await.unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, HarnessError::WebSocket(_)));

    scope.teardown().await.unwrap();
}
