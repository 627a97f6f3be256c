//! Client handle to one connected sandboxed process.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use jsbox_core::{translate_service_features, Error, Feature, IsolateSettings, Result};

use crate::connection::{self, ConnectionGate, PendingConnection};
use crate::isolate::{IsolateInner, JsIsolate};
use crate::service::{SandboxService, ServiceBinder};

/// Client-side handle to one connected instance of the sandboxed process.
///
/// Cheap to clone and safe to share across threads; all clones refer to the
/// same connection. Explicit [`JsSandbox::close`] is the contract; the drop
/// safety net only exists to avoid leaking the process connection.
#[derive(Clone)]
pub struct JsSandbox {
    inner: Arc<SandboxInner>,
}

impl std::fmt::Debug for JsSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsSandbox").finish_non_exhaustive()
    }
}

pub(crate) struct SandboxInner {
    binder: Arc<dyn ServiceBinder>,
    gate: Arc<ConnectionGate>,
    state: Mutex<SandboxState>,
}

enum SandboxState {
    Connected {
        service: Arc<dyn SandboxService>,
        isolates: Vec<Arc<IsolateInner>>,
        /// Translated feature set, fetched lazily once per connection.
        features: Option<HashSet<Feature>>,
    },
    Closed,
}

impl JsSandbox {
    /// Asynchronously connect to the sandboxed process behind `binder`.
    ///
    /// At most one connection per `gate` may be in flight or established; a
    /// concurrent second attempt fails with `Error::IllegalState` until the
    /// previous sandbox closes. Dropping the returned handle before it
    /// resolves cancels the attempt and unbinds. Must be called from within
    /// a Tokio runtime.
    pub fn connect(binder: Arc<dyn ServiceBinder>, gate: Arc<ConnectionGate>) -> PendingConnection {
        connection::connect(binder, gate)
    }

    pub(crate) fn attach(
        service: Arc<dyn SandboxService>,
        binder: Arc<dyn ServiceBinder>,
        gate: Arc<ConnectionGate>,
    ) -> Self {
        Self {
            inner: Arc::new(SandboxInner {
                binder,
                gate,
                state: Mutex::new(SandboxState::Connected {
                    service,
                    isolates: Vec::new(),
                    features: None,
                }),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<SandboxInner> {
        Arc::downgrade(&self.inner)
    }

    /// Create an isolate with default settings.
    pub async fn create_isolate(&self) -> Result<JsIsolate> {
        self.create_isolate_with_settings(IsolateSettings::default())
            .await
    }

    /// Create an isolate with the given settings.
    ///
    /// A nonzero maximum heap size requires [`Feature::IsolateMaxHeapSize`];
    /// a service that cannot enforce the bound yields `Error::Unsupported`
    /// rather than a silently unconstrained isolate.
    pub async fn create_isolate_with_settings(
        &self,
        settings: IsolateSettings,
    ) -> Result<JsIsolate> {
        let service = self.inner.connected_service("create_isolate")?;
        let handle = if settings.max_heap_size_bytes == 0 {
            service.create_isolate().await?
        } else {
            service
                .create_isolate_with_max_heap_size(settings.max_heap_size_bytes)
                .await?
                .ok_or_else(|| {
                    Error::unsupported("the connected service cannot enforce a maximum heap size")
                })?
        };

        let isolate = IsolateInner::spawn(handle, Arc::downgrade(&self.inner));
        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            SandboxState::Connected { isolates, .. } => isolates.push(Arc::clone(&isolate)),
            SandboxState::Closed => {
                drop(state);
                // The sandbox closed while the remote allocation was in
                // flight; release the fresh isolate again.
                isolate.close();
                return Err(Error::illegal_state(
                    "sandbox was closed while creating an isolate",
                ));
            }
        }
        Ok(JsIsolate::new(isolate))
    }

    /// Whether the connected service version supports `feature`.
    ///
    /// The raw feature list is fetched from the service once per connection
    /// and memoized.
    pub async fn is_feature_supported(&self, feature: Feature) -> Result<bool> {
        let service = {
            let state = self.inner.state.lock().unwrap();
            match &*state {
                SandboxState::Connected {
                    features: Some(features),
                    ..
                } => return Ok(features.contains(&feature)),
                SandboxState::Connected { service, .. } => Arc::clone(service),
                SandboxState::Closed => {
                    return Err(Error::illegal_state(
                        "is_feature_supported on a sandbox that isn't connected",
                    ))
                }
            }
        };

        let raw = service.supported_features().await?;
        let translated = translate_service_features(&raw);

        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            SandboxState::Connected { features, .. } => {
                let features = features.get_or_insert(translated);
                Ok(features.contains(&feature))
            }
            SandboxState::Closed => Err(Error::illegal_state(
                "is_feature_supported on a sandbox that isn't connected",
            )),
        }
    }

    /// Close the sandbox and render it unusable.
    ///
    /// Idempotent. Cancels every pending evaluation across every live
    /// isolate with `Error::Terminated`, releases the process connection
    /// and the connection gate; a new connect may then succeed.
    pub fn close(&self) {
        self.inner
            .shut_down(&Error::terminated("sandbox was closed"));
    }
}

impl SandboxInner {
    fn connected_service(&self, operation: &str) -> Result<Arc<dyn SandboxService>> {
        match &*self.state.lock().unwrap() {
            SandboxState::Connected { service, .. } => Ok(Arc::clone(service)),
            SandboxState::Closed => Err(Error::illegal_state(format!(
                "{operation} on a sandbox that isn't connected"
            ))),
        }
    }

    /// Tear down the connection, settling all pending work with `error`.
    /// Shared by user-initiated close and connection-loss handling.
    pub(crate) fn shut_down(&self, error: &Error) {
        let state = std::mem::replace(&mut *self.state.lock().unwrap(), SandboxState::Closed);
        let SandboxState::Connected { isolates, .. } = state else {
            return;
        };
        for isolate in &isolates {
            isolate.cancel_all_pending(error);
        }
        self.binder.unbind();
        self.gate.release();
        tracing::info!(isolates = isolates.len(), "sandbox connection released");
    }

    /// Drop an individually closed isolate from the live set so a later
    /// sandbox-wide close does not double-process it.
    pub(crate) fn remove_isolate(&self, isolate: &IsolateInner) {
        if let SandboxState::Connected { isolates, .. } = &mut *self.state.lock().unwrap() {
            isolates.retain(|candidate| !std::ptr::eq(Arc::as_ptr(candidate), isolate));
        }
    }
}

impl Drop for SandboxInner {
    fn drop(&mut self) {
        let still_connected = matches!(
            &*self.state.get_mut().unwrap(),
            SandboxState::Connected { .. }
        );
        if still_connected {
            tracing::warn!("sandbox dropped while still connected; close() is the contract");
            self.shut_down(&Error::terminated("sandbox was dropped without close()"));
        }
    }
}
