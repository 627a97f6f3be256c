//! One JavaScript execution context within the sandboxed process.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use jsbox_core::{Error, Result};

use crate::pending::{PendingRequest, PendingRequestRegistry};
use crate::sandbox::SandboxInner;
use crate::service::{EvaluationCallback, EvaluationErrorKind, IsolateHandle, SizedByteSource};

/// Buffer capacity of the in-memory pipe used for named-data transfer.
const NAMED_DATA_PIPE_CAPACITY: usize = 64 * 1024;

/// Handle to one isolate: an independent JS global scope inside the
/// sandboxed process.
///
/// Evaluations submitted through one isolate run remotely one at a time, in
/// submission order, against its single global scope; globals set by an
/// earlier evaluation are visible to later ones. No ordering holds across
/// isolates. The handle is single-owner; close it (or let it drop) when
/// done.
pub struct JsIsolate {
    inner: Arc<IsolateInner>,
}

impl JsIsolate {
    pub(crate) fn new(inner: Arc<IsolateInner>) -> Self {
        Self { inner }
    }

    /// Queue `code` for evaluation in the isolate's global scope.
    ///
    /// Fails synchronously with `Error::IllegalState` once the isolate has
    /// been closed. If the sandbox is torn down concurrently, the returned
    /// future is already settled with `Error::Terminated` and the remote is
    /// never contacted.
    ///
    /// Result semantics: a JS string yields that string; a JS promise
    /// yields the awaited string when the service supports promise return
    /// and the empty string otherwise; any other JS value yields the empty
    /// string.
    pub fn evaluate(&self, code: impl Into<String>) -> Result<PendingEvaluation> {
        self.inner.evaluate(code.into())
    }

    /// Provide a one-time named byte buffer for consumption inside the JS
    /// environment.
    ///
    /// Requires the `ProvideConsumeArrayBuffer` capability on the connected
    /// service. The bytes are streamed through a pipe by a background task;
    /// write failures in that task are logged, not raised. Returns
    /// `Ok(true)` only if the service accepted the transfer; transport
    /// failures are logged and yield `Ok(false)`. Each name is consumable
    /// remotely exactly once; callers are responsible for uniqueness.
    pub async fn provide_named_data(&self, name: &str, bytes: Bytes) -> Result<bool> {
        self.inner.provide_named_data(name, bytes).await
    }

    /// Close the isolate and render it unusable.
    ///
    /// Idempotent. Pending evaluations settle with `Error::Terminated`
    /// immediately; the remote isolate close is best-effort and transport
    /// errors from it are logged, not propagated.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for JsIsolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsIsolate").finish_non_exhaustive()
    }
}

impl Drop for JsIsolate {
    fn drop(&mut self) {
        if self.inner.close() {
            tracing::warn!("isolate dropped while still open; close() is the contract");
        }
    }
}

/// Awaitable result of one `evaluate` call. It is never left unresolved:
/// closing the isolate or losing the sandbox settles it with an error.
#[derive(Debug)]
pub struct PendingEvaluation {
    outcome: oneshot::Receiver<Result<String>>,
}

impl Future for PendingEvaluation {
    type Output = Result<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome)
            .poll(cx)
            .map(|settled| match settled {
                Ok(outcome) => outcome,
                // The completion slot only disappears unsettled while the
                // process around it is tearing down.
                Err(_) => Err(Error::terminated("pending evaluation was abandoned")),
            })
    }
}

struct EvaluationJob {
    request: Arc<PendingRequest>,
    code: String,
}

struct OpenState {
    handle: Arc<dyn IsolateHandle>,
    /// Feeds the submission worker; dropping it stops the worker.
    jobs: mpsc::UnboundedSender<EvaluationJob>,
}

pub(crate) struct IsolateInner {
    /// `Some` until the isolate closes; cleared exactly once.
    state: Mutex<Option<OpenState>>,
    pending: Arc<PendingRequestRegistry>,
    sandbox: Weak<SandboxInner>,
}

impl IsolateInner {
    pub(crate) fn spawn(
        handle: Arc<dyn IsolateHandle>,
        sandbox: Weak<SandboxInner>,
    ) -> Arc<Self> {
        let pending = Arc::new(PendingRequestRegistry::new());
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_submissions(
            Arc::clone(&handle),
            Arc::clone(&pending),
            jobs_rx,
        ));
        Arc::new(Self {
            state: Mutex::new(Some(OpenState {
                handle,
                jobs: jobs_tx,
            })),
            pending,
            sandbox,
        })
    }

    fn evaluate(&self, code: String) -> Result<PendingEvaluation> {
        let state = self.state.lock().unwrap();
        let Some(open) = state.as_ref() else {
            return Err(Error::illegal_state("evaluate() called on a closed isolate"));
        };

        let (request, outcome) = PendingRequest::new(self.pending.next_id());
        if !self.pending.try_register(&request) {
            // Terminated concurrently by the owning sandbox: the caller
            // still gets a settled future, and the remote is not contacted.
            request.settle(Err(Error::terminated("isolate was terminated")));
            return Ok(PendingEvaluation { outcome });
        }

        let job = EvaluationJob {
            request: Arc::clone(&request),
            code,
        };
        if open.jobs.send(job).is_err() {
            self.pending.remove(request.id());
            request.settle(Err(Error::terminated("isolate submission worker is gone")));
        }
        Ok(PendingEvaluation { outcome })
    }

    async fn provide_named_data(&self, name: &str, bytes: Bytes) -> Result<bool> {
        let handle = {
            let state = self.state.lock().unwrap();
            let Some(open) = state.as_ref() else {
                return Err(Error::illegal_state(
                    "provide_named_data() called on a closed isolate",
                ));
            };
            Arc::clone(&open.handle)
        };
        if name.is_empty() {
            return Err(Error::invalid_argument(
                "named data requires a non-empty name",
            ));
        }

        let len = bytes.len() as u64;
        let (reader, mut writer) = tokio::io::duplex(NAMED_DATA_PIPE_CAPACITY);
        tokio::spawn(async move {
            if let Err(error) = writer.write_all(&bytes).await {
                tracing::error!(error = %error, "writing named data into the pipe failed");
            }
            let _ = writer.shutdown().await;
        });

        match handle
            .provide_named_data(name.to_string(), SizedByteSource::new(reader, len))
            .await
        {
            Ok(accepted) => Ok(accepted),
            Err(error) => {
                tracing::error!(error = %error, name = name, "provide_named_data transport failure");
                Ok(false)
            }
        }
    }

    /// Close the isolate. Returns `true` if this call performed the close.
    pub(crate) fn close(&self) -> bool {
        let Some(open) = self.state.lock().unwrap().take() else {
            return false;
        };
        self.cancel_all_pending(&Error::terminated("isolate was closed"));

        let handle = open.handle;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(error) = handle.close().await {
                        tracing::error!(error = %error, "remote isolate close failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!("no async runtime available; skipping remote isolate close");
            }
        }

        if let Some(sandbox) = self.sandbox.upgrade() {
            sandbox.remove_isolate(self);
        }
        true
        // `open.jobs` drops here, stopping the submission worker.
    }

    /// Settle every pending evaluation with clones of `error`. Invoked by
    /// `close()` and by the owning sandbox on sandbox-wide teardown.
    pub(crate) fn cancel_all_pending(&self, error: &Error) {
        self.pending.cancel_all(error);
    }
}

/// Forwards queued evaluations to the remote isolate one at a time,
/// preserving submission order.
async fn run_submissions(
    handle: Arc<dyn IsolateHandle>,
    pending: Arc<PendingRequestRegistry>,
    mut jobs: mpsc::UnboundedReceiver<EvaluationJob>,
) {
    while let Some(job) = jobs.recv().await {
        if job.request.is_settled() {
            // Cancelled while still queued locally; skip the remote call.
            continue;
        }
        let sink = Arc::new(CompletionSink {
            request: Arc::clone(&job.request),
            registry: Arc::clone(&pending),
        });
        if let Err(error) = handle.evaluate_javascript(job.code, sink).await {
            pending.remove(job.request.id());
            job.request.settle(Err(error));
        }
    }
}

/// Completion sink keyed to one pending request; invoked by the remote side
/// at most once.
struct CompletionSink {
    request: Arc<PendingRequest>,
    registry: Arc<PendingRequestRegistry>,
}

impl EvaluationCallback for CompletionSink {
    fn report_result(&self, result: String) {
        self.request.settle(Ok(result));
        self.registry.remove(self.request.id());
    }

    fn report_error(&self, _kind: EvaluationErrorKind, message: String) {
        self.request.settle(Err(Error::evaluation_failed(message)));
        self.registry.remove(self.request.id());
    }
}
