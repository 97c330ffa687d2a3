//! Call-id assignment tests.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde_json::json;

use rpc_harness_core::call_id::{split_call_id, CallIdStrategy};
use rpc_harness_core::error::{ConfigError, HarnessError};
use rpc_harness_core::service::{CallContext, HandlerResult, WorkerHook};
use rpc_harness_core::{Harness, HarnessConfig, ServiceDefinition};

/// Records the call id of every worker it sees, in setup order.
#[derive(Default)]
struct CaptureCallIds {
    seen: Mutex<Vec<String>>,
}

impl CaptureCallIds {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl WorkerHook for CaptureCallIds {
    fn worker_setup(&self, ctx: &CallContext) {
        self.seen.lock().unwrap().push(ctx.call_id().to_string());
    }
}

/// Records the call-id stack a worker finished with.
#[derive(Default)]
struct CaptureStacks {
    stacks: Mutex<Vec<Vec<String>>>,
}

impl WorkerHook for CaptureStacks {
    fn worker_result(&self, ctx: &CallContext, _result: &HandlerResult) {
        self.stacks.lock().unwrap().push(ctx.call_id_stack());
    }
}

fn x_calling_y(hook: Arc<dyn WorkerHook>) -> [ServiceDefinition; 2] {
    let x = ServiceDefinition::new("x")
        .rpc("method", |ctx, args| async move {
            ctx.rpc_proxy("y")
                .call("method", args)
                .await
                .map_err(Into::into)
        })
        .with_shared_hook(Arc::clone(&hook));
    let y = ServiceDefinition::new("y")
        .rpc("method", |_ctx, _args| async { Ok(json!("OK")) })
        .with_shared_hook(hook);
    [x, y]
}

/// x calls y once; with sequential ids the ids are x.method.1 then y.method.2.
#[tokio::test]
async fn test_sequential_ids_follow_dispatch_order() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    scope.deterministic_call_ids().unwrap();
    assert_eq!(scope.call_id_strategy(), CallIdStrategy::Sequential);

    let capture = Arc::new(CaptureCallIds::default());
    let runner = scope
        .runner(scope.config().await.unwrap(), x_calling_y(capture.clone()))
        .unwrap();
    runner.start().await.unwrap();

    let client = scope.rpc_client().await.unwrap();
    assert_eq!(client.call("x", "method", json!({})).await.unwrap(), json!("OK"));
    assert_eq!(capture.seen(), vec!["x.method.1", "y.method.2"]);

    scope.teardown().await.unwrap();
}

/// Nested calls carry the caller's id stack.
#[tokio::test]
async fn test_call_id_stack_propagates() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    scope.deterministic_call_ids().unwrap();

    let capture = Arc::new(CaptureStacks::default());
    let runner = scope
        .runner(scope.config().await.unwrap(), x_calling_y(capture.clone()))
        .unwrap();
    runner.start().await.unwrap();

    let client = scope.rpc_client().await.unwrap();
    client.call("x", "method", json!({})).await.unwrap();

    // y finishes first.
    let stacks = capture.stacks.lock().unwrap().clone();
    assert_eq!(
        stacks,
        vec![
            vec!["x.method.1".to_string(), "y.method.2".to_string()],
            vec!["x.method.1".to_string()],
        ]
    );

    scope.teardown().await.unwrap();
}

/// Concurrent calls from many callers into two containers get 1..=N exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_ids_are_gap_free_under_concurrency() {
    const CALLS: usize = 50;

    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    scope.deterministic_call_ids().unwrap();

    let capture = Arc::new(CaptureCallIds::default());
    let hook: Arc<dyn WorkerHook> = capture.clone();
    let a = ServiceDefinition::new("a")
        .rpc("method", |_ctx, _args| async { Ok(json!(null)) })
        .with_shared_hook(Arc::clone(&hook));
    let b = ServiceDefinition::new("b")
        .rpc("method", |_ctx, _args| async { Ok(json!(null)) })
        .with_shared_hook(hook);
    let runner = scope.runner(scope.config().await.unwrap(), [a, b]).unwrap();
    runner.start().await.unwrap();

    let client = scope.rpc_client().await.unwrap();
    let calls = (0..CALLS).map(|i| {
        let client = Arc::clone(&client);
        let service = if i % 2 == 0 { "a" } else { "b" };
        tokio::spawn(async move { client.call(service, "method", json!(i)).await })
    });
    for result in join_all(calls).await {
        result.unwrap().unwrap();
    }

    let sequence: BTreeSet<usize> = capture
        .seen()
        .iter()
        .map(|id| split_call_id(id).unwrap().2.parse().unwrap())
        .collect();
    assert_eq!(sequence.len(), CALLS);
    assert_eq!(sequence, (1..=CALLS).collect::<BTreeSet<_>>());

    scope.teardown().await.unwrap();
}

#[tokio::test]
async fn test_random_ids_by_default() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();
    assert_eq!(scope.call_id_strategy(), CallIdStrategy::Random);

    let capture = Arc::new(CaptureCallIds::default());
    let runner = scope
        .runner(scope.config().await.unwrap(), x_calling_y(capture.clone()))
        .unwrap();
    runner.start().await.unwrap();

    let client = scope.rpc_client().await.unwrap();
    client.call("x", "method", json!({})).await.unwrap();

    let seen = capture.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].starts_with("x.method."));
    assert!(seen[1].starts_with("y.method."));
    assert_ne!(seen[0], "x.method.1");

    scope.teardown().await.unwrap();
}

#[tokio::test]
async fn test_sequential_strategy_from_config() {
    let config = HarnessConfig::from_str("call_ids: sequential\n").unwrap();
    let harness = Harness::builder().config(config).build().unwrap();
    let scope = harness.scope();
    assert_eq!(scope.call_id_strategy(), CallIdStrategy::Sequential);
}

/// Selecting sequential ids after a container started is rejected and does
/// not change the ids handed out.
#[tokio::test]
async fn test_late_selection_is_rejected() {
    let harness = Harness::builder().build().unwrap();
    let scope = harness.scope();

    let capture = Arc::new(CaptureCallIds::default());
    let runner = scope
        .runner(scope.config().await.unwrap(), x_calling_y(capture.clone()))
        .unwrap();
    runner.start().await.unwrap();

    let err = scope.deterministic_call_ids().unwrap_err();
    assert!(matches!(
        err,
        HarnessError::Configuration(ConfigError::CallIdStrategyFrozen { .. })
    ));
    assert_eq!(scope.call_id_strategy(), CallIdStrategy::Random);

    let client = scope.rpc_client().await.unwrap();
    client.call("x", "method", json!({})).await.unwrap();
    assert!(!capture.seen().contains(&"x.method.1".to_string()));

    scope.teardown().await.unwrap();
}

/// Scopes do not share counters.
#[tokio::test]
async fn test_each_scope_counts_from_one() {
    let harness = Harness::builder().build().unwrap();

    for _ in 0..2 {
        let scope = harness.scope();
        scope.deterministic_call_ids().unwrap();
        let capture = Arc::new(CaptureCallIds::default());
        let runner = scope
            .runner(scope.config().await.unwrap(), x_calling_y(capture.clone()))
            .unwrap();
        runner.start().await.unwrap();

        let client = scope.rpc_client().await.unwrap();
        client.call("x", "method", json!({})).await.unwrap();
        assert_eq!(capture.seen()[0], "x.method.1");

        scope.teardown().await.unwrap();
    }
}
