//! Sandbox client integration tests.
//!
//! Drives the full pipeline (JsSandbox → JsIsolate → service stubs) using
//! the in-process mock service, so no real sandboxed process is required.

use std::sync::Arc;

use bytes::Bytes;

use jsbox_client::mock::{BindBehavior, MockSandboxService, MockServiceBinder};
use jsbox_client::{ConnectionGate, JsSandbox};
use jsbox_core::features::service_tokens;
use jsbox_core::{Error, Feature, IsolateSettings};

// =============================================================================
// Helpers
// =============================================================================

struct Harness {
    service: Arc<MockSandboxService>,
    binder: Arc<MockServiceBinder>,
    gate: Arc<ConnectionGate>,
}

impl Harness {
    fn new() -> Self {
        Self::with_service(MockSandboxService::new())
    }

    fn with_service(service: Arc<MockSandboxService>) -> Self {
        let binder = MockServiceBinder::new(Arc::clone(&service));
        Self {
            service,
            binder,
            gate: Arc::new(ConnectionGate::new()),
        }
    }

    async fn connect(&self) -> JsSandbox {
        JsSandbox::connect(self.binder.clone(), Arc::clone(&self.gate))
            .await
            .expect("connect should succeed")
    }
}

async fn settle_background_tasks() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// 1. Connect → create isolate → evaluate
// =============================================================================

#[tokio::test]
async fn test_connect_create_evaluate() {
    let harness = Harness::new();
    let sandbox = harness.connect().await;
    let isolate = sandbox.create_isolate().await.unwrap();

    let result = isolate.evaluate("'abc'").unwrap().await.unwrap();
    assert_eq!(result, "abc");

    isolate.close();
    sandbox.close();
    assert!(harness.gate.is_ready());
}

// =============================================================================
// 2. Submission order and shared global scope
// =============================================================================

#[tokio::test]
async fn test_evaluations_keep_submission_order() {
    let harness = Harness::new();
    let sandbox = harness.connect().await;
    let isolate = sandbox.create_isolate().await.unwrap();

    let codes = [
        "globalThis.step = 'one'",
        "'interleaved'",
        "globalThis.step = 'two'",
        "globalThis.step",
        "'tail'",
    ];
    let mut handles = Vec::new();
    for code in codes {
        handles.push(isolate.evaluate(code).unwrap());
    }

    let results = futures::future::join_all(handles).await;
    // The lookup sees the assignment that was submitted before it.
    assert_eq!(results[3].as_ref().unwrap(), "two");

    // The remote observed every submission in the order it was made.
    assert_eq!(harness.service.isolate(0).submissions(), codes);

    isolate.close();
    sandbox.close();
}

// =============================================================================
// 3. Closing an isolate settles its pending evaluations
// =============================================================================

#[tokio::test]
async fn test_isolate_close_settles_all_pending() {
    let harness = Harness::new();
    let sandbox = harness.connect().await;
    let isolate = sandbox.create_isolate().await.unwrap();

    let mut pending = Vec::new();
    for _ in 0..5 {
        pending.push(isolate.evaluate("new Promise(() => {})").unwrap());
    }
    settle_background_tasks().await;
    // All five reached the remote and are still running there.
    assert_eq!(harness.service.isolate(0).held_callback_count(), 5);
    isolate.close();

    for future in pending {
        match future.await {
            Err(Error::Terminated(_)) => {}
            other => panic!("expected Terminated, got {other:?}"),
        }
    }

    // Closed for good: new evaluations fail synchronously.
    match isolate.evaluate("'after'") {
        Err(Error::IllegalState(_)) => {}
        other => panic!("expected IllegalState, got {other:?}"),
    }

    sandbox.close();
}

// =============================================================================
// 4. Closing the sandbox tears down every isolate's pending work
// =============================================================================

#[tokio::test]
async fn test_sandbox_close_cancels_across_isolates() {
    let harness = Harness::new();
    let sandbox = harness.connect().await;
    let first = sandbox.create_isolate().await.unwrap();
    let second = sandbox.create_isolate().await.unwrap();

    let pending_first = first.evaluate("new Promise(() => {})").unwrap();
    let pending_second = second.evaluate("new Promise(() => {})").unwrap();
    settle_background_tasks().await;

    sandbox.close();

    for future in [pending_first, pending_second] {
        match future.await {
            Err(Error::Terminated(_)) => {}
            other => panic!("expected Terminated, got {other:?}"),
        }
    }

    // The sandbox is unusable afterwards.
    match sandbox.create_isolate().await {
        Err(Error::IllegalState(_)) => {}
        other => panic!("expected IllegalState, got {other:?}"),
    }

    // An isolate the sandbox tore down is not closed in the local sense:
    // evaluate still hands back a future, already settled with Terminated.
    match first.evaluate("'late'").unwrap().await {
        Err(Error::Terminated(_)) => {}
        other => panic!("expected Terminated, got {other:?}"),
    }
}

// =============================================================================
// 5. One connection at a time per gate
// =============================================================================

#[tokio::test]
async fn test_single_connection_per_gate() {
    let harness = Harness::new();

    let first = JsSandbox::connect(
        harness.binder.clone(),
        Arc::clone(&harness.gate),
    );
    let second = JsSandbox::connect(
        harness.binder.clone(),
        Arc::clone(&harness.gate),
    );

    match second.await {
        Err(Error::IllegalState(_)) => {}
        other => panic!("expected IllegalState, got {other:?}"),
    }

    let sandbox = first.await.unwrap();
    sandbox.close();

    // After close the gate admits a fresh attempt.
    let reconnected = harness.connect().await;
    reconnected.close();
}

// =============================================================================
// 6. Remote process death settles pending work with SandboxDead
// =============================================================================

#[tokio::test]
async fn test_process_death_mid_evaluation() {
    let harness = Harness::new();
    let sandbox = harness.connect().await;
    let isolate = sandbox.create_isolate().await.unwrap();

    let stuck = isolate.evaluate("new Promise(() => {})").unwrap();
    settle_background_tasks().await;

    harness.binder.kill();

    match stuck.await {
        Err(Error::SandboxDead(_)) => {}
        other => panic!("expected SandboxDead, got {other:?}"),
    }

    // The gate is free again; a reconnect succeeds.
    settle_background_tasks().await;
    assert!(harness.gate.is_ready());
    let reconnected = harness.connect().await;
    reconnected.close();
}

// =============================================================================
// 7. Capability negotiation
// =============================================================================

#[tokio::test]
async fn test_feature_negotiation_and_promise_return() {
    // A service with the full capability set awaits promises.
    let full = Harness::new();
    let sandbox = full.connect().await;
    assert!(sandbox
        .is_feature_supported(Feature::PromiseReturn)
        .await
        .unwrap());
    let isolate = sandbox.create_isolate().await.unwrap();
    let result = isolate.evaluate("Promise.resolve('later')").unwrap().await;
    assert_eq!(result.unwrap(), "later");
    isolate.close();
    sandbox.close();

    // An older service yields the empty string instead.
    let old = Harness::with_service(MockSandboxService::with_features(&[
        service_tokens::ISOLATE_TERMINATION,
    ]));
    let sandbox = old.connect().await;
    assert!(!sandbox
        .is_feature_supported(Feature::PromiseReturn)
        .await
        .unwrap());
    let isolate = sandbox.create_isolate().await.unwrap();
    let result = isolate.evaluate("Promise.resolve('later')").unwrap().await;
    assert_eq!(result.unwrap(), "");
    isolate.close();
    sandbox.close();
}

// =============================================================================
// 8. Bounded heap requires service support
// =============================================================================

#[tokio::test]
async fn test_bounded_heap_against_old_service() {
    let harness = Harness::with_service(MockSandboxService::with_features(&[
        service_tokens::ISOLATE_TERMINATION,
        service_tokens::WASM_FROM_ARRAY_BUFFER,
    ]));
    let sandbox = harness.connect().await;

    let settings = IsolateSettings::with_max_heap_size_bytes(32 * 1024 * 1024);
    match sandbox.create_isolate_with_settings(settings).await {
        Err(Error::Unsupported(_)) => {}
        other => panic!("expected Unsupported, got {other:?}"),
    }
    // No silently unconstrained isolate was created.
    assert_eq!(harness.service.isolate_count(), 0);

    sandbox.close();
}

// =============================================================================
// 9. Named-data transfer
// =============================================================================

#[tokio::test]
async fn test_named_data_pipeline() {
    let harness = Harness::new();
    let sandbox = harness.connect().await;
    assert!(sandbox
        .is_feature_supported(Feature::ProvideConsumeArrayBuffer)
        .await
        .unwrap());
    let isolate = sandbox.create_isolate().await.unwrap();

    let payload = Bytes::from(vec![0u8, 1, 2, 3, 254, 255]);
    assert!(isolate
        .provide_named_data("blob-1", payload.clone())
        .await
        .unwrap());
    assert_eq!(
        harness.service.isolate(0).named_data("blob-1").unwrap(),
        payload
    );

    // One-time names: a second transfer under the same name is refused.
    assert!(!isolate
        .provide_named_data("blob-1", payload)
        .await
        .unwrap());

    isolate.close();
    sandbox.close();
}

// =============================================================================
// 10. Cancelled and abandoned connection attempts
// =============================================================================

#[tokio::test]
async fn test_cancelled_connect_releases_everything() {
    let service = MockSandboxService::new();
    let binder = MockServiceBinder::with_behavior(Arc::clone(&service), BindBehavior::Hold);
    let gate = Arc::new(ConnectionGate::new());

    let pending = JsSandbox::connect(binder.clone(), Arc::clone(&gate));
    drop(pending);
    settle_background_tasks().await;

    assert!(gate.is_ready());
    assert_eq!(binder.unbind_count(), 1);

    // The gate admits a fresh attempt afterwards.
    let binder2 = MockServiceBinder::new(service);
    let sandbox = JsSandbox::connect(binder2, gate).await.unwrap();
    sandbox.close();
}

#[tokio::test]
async fn test_null_binding_before_establishment() {
    let service = MockSandboxService::new();
    let binder = MockServiceBinder::with_behavior(service, BindBehavior::Hold);
    let gate = Arc::new(ConnectionGate::new());

    let pending = JsSandbox::connect(binder.clone(), Arc::clone(&gate));
    binder.null_binding();

    match pending.await {
        Err(Error::SandboxDead(_)) => {}
        other => panic!("expected SandboxDead, got {other:?}"),
    }
    assert!(gate.is_ready());
}
