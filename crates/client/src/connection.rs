//! Connection establishment, loss handling, and the process-wide gate.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

use jsbox_core::{Error, Result};

use crate::sandbox::JsSandbox;
use crate::service::{ConnectionEvent, ServiceBinder};

/// "Ready to connect" gate: at most one sandbox connection may be in flight
/// or established per gate at any time.
///
/// The gate is an explicit object rather than an implicit global. An
/// application enforcing the one-sandboxed-process-per-app constraint
/// shares a single gate across all of its connect calls; tests and
/// embedders running independent sandboxes own separate gates.
pub struct ConnectionGate {
    ready: AtomicBool,
}

impl ConnectionGate {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
        }
    }

    /// Whether a connect attempt would currently be admitted.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn try_acquire(&self) -> bool {
        self.ready
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

impl Default for ConnectionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaitable handle for an in-flight connect attempt.
///
/// Dropping the handle before it resolves cancels the attempt: the binder
/// is unbound and the gate released, so no connection attempt leaks.
pub struct PendingConnection {
    outcome: oneshot::Receiver<Result<JsSandbox>>,
    // Dropping this sender is the cancellation signal for the connection
    // task; the task stops listening for it once the sandbox is established.
    _cancel: Option<oneshot::Sender<()>>,
}

impl Future for PendingConnection {
    type Output = Result<JsSandbox>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome).poll(cx).map(|resolved| match resolved {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::sandbox_dead(
                "connection task ended before resolving the attempt",
            )),
        })
    }
}

/// Start an asynchronous connect attempt. Must be called from within a
/// Tokio runtime.
pub(crate) fn connect(
    binder: Arc<dyn ServiceBinder>,
    gate: Arc<ConnectionGate>,
) -> PendingConnection {
    let (outcome_tx, outcome_rx) = oneshot::channel();

    if !gate.try_acquire() {
        let _ = outcome_tx.send(Err(Error::illegal_state(
            "binding to an already bound sandbox service",
        )));
        return PendingConnection {
            outcome: outcome_rx,
            _cancel: None,
        };
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    if !binder.bind(events_tx) {
        binder.unbind();
        gate.release();
        let _ = outcome_tx.send(Err(Error::transport("service bind attempt was rejected")));
        return PendingConnection {
            outcome: outcome_rx,
            _cancel: None,
        };
    }

    let (cancel_tx, cancel_rx) = oneshot::channel();
    tokio::spawn(drive_connection(
        events_rx, cancel_rx, outcome_tx, binder, gate,
    ));
    PendingConnection {
        outcome: outcome_rx,
        _cancel: Some(cancel_tx),
    }
}

/// Services the binder's event stream for one connection, from bind to
/// loss. Transitions: established, lost-after-established,
/// lost-before-established, and cancellation of the attempt.
async fn drive_connection(
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut cancel: oneshot::Receiver<()>,
    outcome: oneshot::Sender<Result<JsSandbox>>,
    binder: Arc<dyn ServiceBinder>,
    gate: Arc<ConnectionGate>,
) {
    // Waiting for establishment. Cancellation is only honored here; once
    // the outcome has been delivered the caller owns teardown.
    let service = tokio::select! {
        biased;
        _ = &mut cancel => {
            binder.unbind();
            gate.release();
            return;
        }
        event = events.recv() => match event {
            Some(ConnectionEvent::Connected(service)) => service,
            Some(event) => {
                binder.unbind();
                gate.release();
                let _ = outcome.send(Err(Error::sandbox_dead(format!(
                    "connection lost before establishment: {}",
                    loss_reason(&event)
                ))));
                return;
            }
            None => {
                binder.unbind();
                gate.release();
                let _ = outcome.send(Err(Error::sandbox_dead(
                    "binder closed the event stream before establishment",
                )));
                return;
            }
        }
    };

    let sandbox = JsSandbox::attach(service, Arc::clone(&binder), Arc::clone(&gate));
    let inner = sandbox.downgrade();
    if let Err(unclaimed) = outcome.send(Ok(sandbox)) {
        // The caller dropped the pending connection as it resolved.
        if let Ok(sandbox) = unclaimed {
            sandbox.close();
        }
        return;
    }

    // Established: watch for connection loss until the stream closes (a
    // user-initiated unbind closes it without any loss event).
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected(_) => {
                tracing::warn!("duplicate connection-established event ignored");
            }
            event => {
                let reason = loss_reason(&event);
                tracing::warn!(reason = reason, "sandbox connection lost");
                if let Some(inner) = inner.upgrade() {
                    inner.shut_down(&Error::sandbox_dead(reason));
                }
                return;
            }
        }
    }
}

fn loss_reason(event: &ConnectionEvent) -> &'static str {
    match event {
        ConnectionEvent::Disconnected => "service disconnected",
        ConnectionEvent::BindingDied => "service binding died",
        ConnectionEvent::NullBinding => "service returned a null binding",
        ConnectionEvent::Connected(_) => "connected",
    }
}
