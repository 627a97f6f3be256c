//! Scriptable in-process stand-ins for the sandboxed service.
//!
//! These mirror the real service closely enough to drive the client through
//! its full lifecycle in tests without an actual sandboxed process: a
//! binder with connect/reject/kill controls, a service with a configurable
//! capability list, and isolates with a deliberately tiny canned evaluator
//! limited to quoted string literals, `globalThis` assignment and lookup,
//! `throw`, and promises.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use jsbox_core::features::service_tokens;
use jsbox_core::{Error, Result};

use crate::service::{
    ConnectionEvent, EvaluationCallback, EvaluationErrorKind, IsolateHandle, SandboxService,
    ServiceBinder, SizedByteSource,
};

// =============================================================================
// Mock Binder
// =============================================================================

/// How a [`MockServiceBinder`] reacts to a bind attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindBehavior {
    /// Accept the bind and deliver `Connected` immediately.
    Connect,
    /// Accept the bind but deliver nothing until told to.
    Hold,
    /// Reject the bind attempt outright (`bind` returns `false`).
    Reject,
}

/// In-process stand-in for the platform binding facility.
pub struct MockServiceBinder {
    service: Arc<MockSandboxService>,
    behavior: BindBehavior,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
    unbinds: AtomicUsize,
}

impl MockServiceBinder {
    /// Binder that connects as soon as a bind attempt is made.
    pub fn new(service: Arc<MockSandboxService>) -> Arc<Self> {
        Self::with_behavior(service, BindBehavior::Connect)
    }

    pub fn with_behavior(service: Arc<MockSandboxService>, behavior: BindBehavior) -> Arc<Self> {
        Arc::new(Self {
            service,
            behavior,
            events: Mutex::new(None),
            unbinds: AtomicUsize::new(0),
        })
    }

    /// Deliver the established event for a `Hold` binder.
    pub fn connect_now(&self) {
        let service: Arc<dyn SandboxService> = self.service.clone();
        self.emit(ConnectionEvent::Connected(service));
    }

    pub fn disconnect(&self) {
        self.emit(ConnectionEvent::Disconnected);
    }

    /// Simulate the sandboxed process dying.
    pub fn kill(&self) {
        self.emit(ConnectionEvent::BindingDied);
    }

    pub fn null_binding(&self) {
        self.emit(ConnectionEvent::NullBinding);
    }

    /// Whether a bind attempt is currently held.
    pub fn is_bound(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }

    pub fn unbind_count(&self) -> usize {
        self.unbinds.load(Ordering::Relaxed)
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &*self.events.lock().unwrap() {
            let _ = events.send(event);
        }
    }
}

impl ServiceBinder for MockServiceBinder {
    fn bind(&self, events: mpsc::UnboundedSender<ConnectionEvent>) -> bool {
        if self.behavior == BindBehavior::Reject {
            return false;
        }
        *self.events.lock().unwrap() = Some(events);
        if self.behavior == BindBehavior::Connect {
            self.connect_now();
        }
        true
    }

    fn unbind(&self) {
        self.unbinds.fetch_add(1, Ordering::Relaxed);
        // Dropping the sender closes the event stream.
        *self.events.lock().unwrap() = None;
    }
}

// =============================================================================
// Mock Service
// =============================================================================

/// In-process stand-in for the sandboxed service process.
pub struct MockSandboxService {
    features: Vec<String>,
    fail_transport: AtomicBool,
    feature_queries: AtomicUsize,
    isolates: Mutex<Vec<Arc<MockIsolate>>>,
}

impl MockSandboxService {
    /// Service advertising every known capability token.
    pub fn new() -> Arc<Self> {
        Self::with_features(&[
            service_tokens::ISOLATE_TERMINATION,
            service_tokens::WASM_FROM_ARRAY_BUFFER,
            service_tokens::ISOLATE_MAX_HEAP_SIZE_LIMIT,
        ])
    }

    /// Service advertising exactly the given raw capability tokens.
    pub fn with_features(features: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            features: features.iter().map(|feature| feature.to_string()).collect(),
            fail_transport: AtomicBool::new(false),
            feature_queries: AtomicUsize::new(0),
            isolates: Mutex::new(Vec::new()),
        })
    }

    /// Make every subsequent service call fail at the transport layer.
    pub fn set_fail_transport(&self, fail: bool) {
        self.fail_transport.store(fail, Ordering::Relaxed);
    }

    /// Number of times the feature list was queried.
    pub fn feature_query_count(&self) -> usize {
        self.feature_queries.load(Ordering::Relaxed)
    }

    pub fn isolate_count(&self) -> usize {
        self.isolates.lock().unwrap().len()
    }

    /// The `index`-th isolate created through this service.
    pub fn isolate(&self, index: usize) -> Arc<MockIsolate> {
        Arc::clone(&self.isolates.lock().unwrap()[index])
    }

    fn new_isolate(&self, max_heap_size_bytes: u64) -> Arc<MockIsolate> {
        let isolate = Arc::new(MockIsolate {
            id: Uuid::new_v4(),
            promise_support: self
                .features
                .iter()
                .any(|feature| feature == service_tokens::WASM_FROM_ARRAY_BUFFER),
            max_heap_size_bytes,
            fail_transport: AtomicBool::new(false),
            state: Mutex::new(MockIsolateState::default()),
        });
        tracing::debug!(isolate_id = %isolate.id, "mock isolate created");
        self.isolates.lock().unwrap().push(Arc::clone(&isolate));
        isolate
    }
}

#[async_trait]
impl SandboxService for MockSandboxService {
    async fn create_isolate(&self) -> Result<Arc<dyn IsolateHandle>> {
        if self.fail_transport.load(Ordering::Relaxed) {
            return Err(Error::transport("mock service refused create_isolate"));
        }
        Ok(self.new_isolate(0))
    }

    async fn create_isolate_with_max_heap_size(
        &self,
        max_heap_size_bytes: u64,
    ) -> Result<Option<Arc<dyn IsolateHandle>>> {
        if self.fail_transport.load(Ordering::Relaxed) {
            return Err(Error::transport("mock service refused create_isolate"));
        }
        if !self
            .features
            .iter()
            .any(|feature| feature == service_tokens::ISOLATE_MAX_HEAP_SIZE_LIMIT)
        {
            return Ok(None);
        }
        Ok(Some(self.new_isolate(max_heap_size_bytes)))
    }

    async fn supported_features(&self) -> Result<Vec<String>> {
        self.feature_queries.fetch_add(1, Ordering::Relaxed);
        if self.fail_transport.load(Ordering::Relaxed) {
            return Err(Error::transport("mock service refused supported_features"));
        }
        Ok(self.features.clone())
    }
}

// =============================================================================
// Mock Isolate
// =============================================================================

#[derive(Default)]
struct MockIsolateState {
    globals: HashMap<String, String>,
    submissions: Vec<String>,
    named_data: HashMap<String, Vec<u8>>,
    // Evaluations that never settle keep their callback parked here, like a
    // remote evaluation that keeps running.
    held_callbacks: Vec<Arc<dyn EvaluationCallback>>,
    closed: bool,
}

/// In-process stand-in for one remote isolate, with a canned evaluator.
pub struct MockIsolate {
    id: Uuid,
    promise_support: bool,
    max_heap_size_bytes: u64,
    fail_transport: AtomicBool,
    state: Mutex<MockIsolateState>,
}

enum Evaluated {
    Value(String),
    Failed(String),
    Never,
}

impl MockIsolate {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Heap bound this isolate was created with; zero means unrestricted.
    pub fn max_heap_size_bytes(&self) -> u64 {
        self.max_heap_size_bytes
    }

    /// Make every subsequent isolate call fail at the transport layer.
    pub fn set_fail_transport(&self, fail: bool) {
        self.fail_transport.store(fail, Ordering::Relaxed);
    }

    /// Every code string submitted so far, in arrival order.
    pub fn submissions(&self) -> Vec<String> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn named_data(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().named_data.get(name).cloned()
    }

    pub fn named_data_count(&self) -> usize {
        self.state.lock().unwrap().named_data.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Number of evaluations that are still running remotely (their
    /// callbacks are parked and will never settle on their own).
    pub fn held_callback_count(&self) -> usize {
        self.state.lock().unwrap().held_callbacks.len()
    }

    fn evaluate_code(&self, code: &str) -> Evaluated {
        let code = code.trim();
        if let Some(rest) = code.strip_prefix("throw") {
            return Evaluated::Failed(extract_quoted(rest).unwrap_or_else(|| code.to_string()));
        }
        if code.starts_with("new Promise") {
            return Evaluated::Never;
        }
        if let Some(inner) = code
            .strip_prefix("Promise.resolve(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            if !self.promise_support {
                return Evaluated::Value(String::new());
            }
            return Evaluated::Value(quoted_literal(inner.trim()).unwrap_or_default());
        }
        if let Some(rest) = code.strip_prefix("globalThis.") {
            if let Some((name, value)) = rest.split_once('=') {
                let value = quoted_literal(value.trim()).unwrap_or_default();
                let mut state = self.state.lock().unwrap();
                state.globals.insert(name.trim().to_string(), value.clone());
                return Evaluated::Value(value);
            }
            let state = self.state.lock().unwrap();
            return Evaluated::Value(state.globals.get(rest.trim()).cloned().unwrap_or_default());
        }
        // Anything else counts as a non-string value: empty result.
        Evaluated::Value(quoted_literal(code).unwrap_or_default())
    }
}

#[async_trait]
impl IsolateHandle for MockIsolate {
    async fn evaluate_javascript(
        &self,
        code: String,
        callback: Arc<dyn EvaluationCallback>,
    ) -> Result<()> {
        if self.fail_transport.load(Ordering::Relaxed) {
            return Err(Error::transport("mock isolate transport failure"));
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(Error::transport("mock isolate is closed"));
            }
            state.submissions.push(code.clone());
        }
        match self.evaluate_code(&code) {
            Evaluated::Value(value) => callback.report_result(value),
            Evaluated::Failed(message) => {
                callback.report_error(EvaluationErrorKind::JsEvaluationError, message)
            }
            Evaluated::Never => self.state.lock().unwrap().held_callbacks.push(callback),
        }
        Ok(())
    }

    async fn provide_named_data(&self, name: String, data: SizedByteSource) -> Result<bool> {
        if self.fail_transport.load(Ordering::Relaxed) {
            return Err(Error::transport("mock isolate transport failure"));
        }
        {
            let state = self.state.lock().unwrap();
            if state.closed {
                return Err(Error::transport("mock isolate is closed"));
            }
            if state.named_data.contains_key(&name) {
                return Ok(false);
            }
        }
        let bytes = match data.read_to_end().await {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::debug!(error = %error, "mock named-data read failed");
                return Ok(false);
            }
        };
        self.state.lock().unwrap().named_data.insert(name, bytes);
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        if self.fail_transport.load(Ordering::Relaxed) {
            return Err(Error::transport("mock isolate transport failure"));
        }
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

fn quoted_literal(code: &str) -> Option<String> {
    let bytes = code.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        return Some(code[1..code.len() - 1].to_string());
    }
    None
}

fn extract_quoted(code: &str) -> Option<String> {
    let open = code.find(['\'', '"'])?;
    let quote = code.as_bytes()[open] as char;
    let close = code[open + 1..].find(quote)?;
    Some(code[open + 1..open + 1 + close].to_string())
}
