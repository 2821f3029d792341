//! Error types for session lifecycle operations.

use std::time::Duration;

use thiserror::Error;

use crate::session::subscription::SubscriptionError;
use crate::session::SessionId;

/// Errors raised by process and terminal operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Opening the session's event subscriptions failed.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// A process RPC failed.
    #[error("process execution failed: {message}")]
    Execution { message: String },

    /// A terminal RPC failed.
    #[error("terminal operation failed: {message}")]
    Terminal { message: String },

    /// The requested working directory does not exist in the sandbox.
    #[error("working directory {path} is not available: {message}")]
    WorkingDirectory { path: String, message: String },

    /// The start RPC did not complete in time.
    #[error("session {id} did not start within {timeout:?}")]
    StartTimeout { id: SessionId, timeout: Duration },

    /// A live session with the same id already exists on this service.
    #[error("session id already in use: {id}")]
    IdConflict { id: SessionId },

    /// The session was killed while it was still starting.
    #[error("session {id} was killed before it finished starting")]
    Aborted { id: SessionId },

    /// The session was torn down by `Sandbox::close` before it finished.
    #[error("session {id} was closed before it finished")]
    Closed { id: SessionId },

    /// The sandbox connection has been closed.
    #[error("sandbox is closed")]
    SandboxClosed,
}

impl SessionError {
    /// True for errors carrying a remote RPC failure message.
    pub fn is_rpc_failure(&self) -> bool {
        matches!(
            self,
            SessionError::Execution { .. }
                | SessionError::Terminal { .. }
                | SessionError::WorkingDirectory { .. }
        )
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
