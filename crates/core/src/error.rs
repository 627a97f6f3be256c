//! Error types for jsbox.

use thiserror::Error;

/// Result type alias using jsbox's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for jsbox.
///
/// The enum is `Clone` so that a single termination error can be fanned out
/// to every pending evaluation when an isolate or sandbox shuts down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Operation invoked after close, or before a connection was established.
    /// Always synchronous, always fatal to that call only.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A required argument was missing or malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The connected service version lacks the requested capability.
    #[error("Unsupported by the connected service: {0}")]
    Unsupported(String),

    /// The isolate or sandbox was closed before the evaluation could finish.
    #[error("Isolate terminated: {0}")]
    Terminated(String),

    /// The connection to the sandboxed process was lost unexpectedly.
    #[error("Sandbox dead: {0}")]
    SandboxDead(String),

    /// The code was received and run by the sandboxed process, but JS
    /// execution itself raised. Carries the remote-supplied message.
    #[error("Evaluation failed: {0}")]
    EvaluationFailed(String),

    /// The call across the process boundary itself failed.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Create an illegal state error.
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an unsupported capability error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a terminated error.
    pub fn terminated(msg: impl Into<String>) -> Self {
        Self::Terminated(msg.into())
    }

    /// Create a sandbox dead error.
    pub fn sandbox_dead(msg: impl Into<String>) -> Self {
        Self::SandboxDead(msg.into())
    }

    /// Create an evaluation failure error.
    pub fn evaluation_failed(msg: impl Into<String>) -> Self {
        Self::EvaluationFailed(msg.into())
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
