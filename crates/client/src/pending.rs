//! Pending-request bookkeeping for one isolate.
//!
//! The registry is the concurrency-safe core of the swap-and-settle
//! teardown pattern: registration races against termination, and for each
//! request exactly one of the two wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use jsbox_core::{Error, Result};

/// One in-flight evaluation: the internal completion slot behind the future
/// handed to the caller.
pub(crate) struct PendingRequest {
    id: u64,
    slot: Mutex<Option<oneshot::Sender<Result<String>>>>,
}

impl PendingRequest {
    /// Create a request together with the receiver its future will await.
    pub(crate) fn new(id: u64) -> (Arc<Self>, oneshot::Receiver<Result<String>>) {
        let (sender, receiver) = oneshot::channel();
        (
            Arc::new(Self {
                id,
                slot: Mutex::new(Some(sender)),
            }),
            receiver,
        )
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Settle the request. The first settle wins; later calls are no-ops.
    pub(crate) fn settle(&self, outcome: Result<String>) {
        if let Some(sender) = self.slot.lock().unwrap().take() {
            // The receiver may be gone if the caller dropped the future.
            let _ = sender.send(outcome);
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.slot.lock().unwrap().is_none()
    }
}

/// Outstanding requests for one isolate: `Open` until the isolate is torn
/// down, then permanently `Terminated`.
enum RegistryState {
    Open(HashMap<u64, Arc<PendingRequest>>),
    Terminated,
}

/// Concurrency-safe set of outstanding completion slots for one isolate.
/// The lock is never held across an await point.
pub(crate) struct PendingRequestRegistry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

impl PendingRequestRegistry {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::Open(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocate an id for a new request.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a request. Returns `false` once the registry has been
    /// drained, meaning the isolate is terminated.
    pub(crate) fn try_register(&self, request: &Arc<PendingRequest>) -> bool {
        match &mut *self.state.lock().unwrap() {
            RegistryState::Open(requests) => {
                requests.insert(request.id(), Arc::clone(request));
                true
            }
            RegistryState::Terminated => false,
        }
    }

    /// Remove a settled request; no-op once terminated.
    pub(crate) fn remove(&self, id: u64) {
        if let RegistryState::Open(requests) = &mut *self.state.lock().unwrap() {
            requests.remove(&id);
        }
    }

    /// Capture every outstanding request and transition to `Terminated`.
    /// Returns `Some` at most once; this is the only way the registry
    /// terminates.
    pub(crate) fn drain(&self) -> Option<Vec<Arc<PendingRequest>>> {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, RegistryState::Terminated) {
            RegistryState::Open(requests) => Some(requests.into_values().collect()),
            RegistryState::Terminated => None,
        }
    }

    /// Settle every outstanding request with clones of `error` and
    /// terminate the registry. Safe to call repeatedly and with zero
    /// pending requests.
    pub(crate) fn cancel_all(&self, error: &Error) {
        if let Some(requests) = self.drain() {
            for request in requests {
                request.settle(Err(error.clone()));
            }
        }
    }
}
