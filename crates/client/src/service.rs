//! Contracts between the client and the sandboxed service process.
//!
//! Everything that crosses the process boundary is expressed against these
//! traits. The production implementations are supplied by the embedding
//! platform's binding facility; the test suite uses the in-process
//! stand-ins in [`crate::mock`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use jsbox_core::Result;

// =============================================================================
// Connection lifecycle
// =============================================================================

/// Lifecycle notification emitted by a [`ServiceBinder`] after a bind
/// attempt was accepted.
pub enum ConnectionEvent {
    /// The sandboxed process is up and its service stub is available.
    Connected(Arc<dyn SandboxService>),
    /// The platform reported the connection as disconnected.
    Disconnected,
    /// The binding to the sandboxed process died (process crash or forced
    /// unbind).
    BindingDied,
    /// The platform produced a null binding for the service.
    NullBinding,
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected(_) => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::BindingDied => write!(f, "BindingDied"),
            Self::NullBinding => write!(f, "NullBinding"),
        }
    }
}

/// Platform facility that starts and releases the connection to the
/// sandboxed process.
///
/// `bind` is a synchronous accept/reject of the attempt; lifecycle progress
/// arrives asynchronously as [`ConnectionEvent`]s on the provided sender.
/// After `unbind` no further events may be delivered for that attempt.
pub trait ServiceBinder: Send + Sync {
    /// Start a bind attempt. Returns `false` if the attempt could not even
    /// be started, in which case no events will be delivered.
    fn bind(&self, events: mpsc::UnboundedSender<ConnectionEvent>) -> bool;

    /// Release a held or attempted connection.
    fn unbind(&self);
}

// =============================================================================
// Remote stubs
// =============================================================================

/// Process-level stub of the connected sandboxed service.
#[async_trait]
pub trait SandboxService: Send + Sync {
    /// Allocate a new isolate with an unrestricted heap.
    async fn create_isolate(&self) -> Result<Arc<dyn IsolateHandle>>;

    /// Allocate a new isolate with a bounded maximum heap size. Returns
    /// `None` when the service version cannot enforce a bound.
    async fn create_isolate_with_max_heap_size(
        &self,
        max_heap_size_bytes: u64,
    ) -> Result<Option<Arc<dyn IsolateHandle>>>;

    /// Raw capability tokens supported by this service version; see
    /// [`jsbox_core::features::service_tokens`].
    async fn supported_features(&self) -> Result<Vec<String>>;
}

/// Per-isolate stub inside the sandboxed process.
#[async_trait]
pub trait IsolateHandle: Send + Sync {
    /// Queue `code` for evaluation. Returns once the evaluation has been
    /// accepted by the remote side; the outcome is delivered exactly once
    /// through `callback`. Evaluations run one at a time, in submission
    /// order, against the isolate's single global scope.
    async fn evaluate_javascript(
        &self,
        code: String,
        callback: Arc<dyn EvaluationCallback>,
    ) -> Result<()>;

    /// Hand the isolate a one-time named byte source. Returns the remote
    /// side's success flag.
    async fn provide_named_data(&self, name: String, data: SizedByteSource) -> Result<bool>;

    /// Release the remote isolate.
    async fn close(&self) -> Result<()>;
}

/// Error kinds a remote evaluation can report through its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationErrorKind {
    /// JS execution itself raised.
    JsEvaluationError,
}

/// Callback surface exposed to the remote process for one evaluation.
pub trait EvaluationCallback: Send + Sync {
    /// The evaluation produced a string result.
    fn report_result(&self, result: String);

    /// The evaluation failed remotely.
    fn report_error(&self, kind: EvaluationErrorKind, message: String);
}

// =============================================================================
// Sized byte source
// =============================================================================

/// The read end of a byte pipe plus its declared length, handed to the
/// service for named-data transfer.
pub struct SizedByteSource {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    len: u64,
}

impl SizedByteSource {
    /// Wrap a reader that will deliver exactly `len` bytes.
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, len: u64) -> Self {
        Self {
            reader: Box::new(reader),
            len,
        }
    }

    /// Declared number of bytes this source will deliver.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drain the source into memory, reading until the write end closes.
    /// Fails if the delivered byte count differs from the declared length.
    pub async fn read_to_end(mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.reader.read_to_end(&mut buf).await?;
        if buf.len() as u64 != self.len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "byte source delivered {} bytes but declared {}",
                    buf.len(),
                    self.len
                ),
            ));
        }
        Ok(buf)
    }
}
