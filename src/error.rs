//! Error types for the SSH runtime, buffer layer and command lifecycle.
//!
//! [`ToolkitError`] is the crate-wide error enum returned by fallible
//! operations. Command containers never unwind across phases; instead a
//! failure is converted into a serializable [`TaskFailure`] and stored in the
//! container's result slot.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

/// Errors that can occur while connecting, reading the shell buffer, managing
/// environments or driving a command container.
#[derive(Error, Debug)]
pub enum ToolkitError {
    /// SSH authentication was refused by the server.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// The socket, proxy or transport could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailure(String),

    /// A session channel or PTY could not be opened on the transport.
    #[error("channel failed: {0}")]
    ChannelFailure(String),

    /// The remote side closed the channel mid-read.
    #[error("buffer closed: {0}")]
    ClosedBuffer(String),

    /// No bytes arrived within the time-to-first-bit bound.
    #[error("no data within time-to-first-bit bound of {0:?}")]
    TimeToFirstBit(Duration),

    /// The gap between successive bytes exceeded the between-bits bound.
    #[error("data gap exceeded between-bits bound of {0:?}")]
    BetweenBits(Duration),

    /// The total run timeout was exhausted.
    #[error("run timeout exhausted: {0}")]
    TotalTimeout(String),

    /// User escalation failed verification and all fallback strategies were
    /// exhausted.
    #[error("unable to become user: {0}")]
    BecomeUserFailure(String),

    /// One or more requirements reported failure or never completed.
    #[error("requirements failed: {0}")]
    RequirementsFailure(String),

    /// A pre-parser raised or returned a failure.
    #[error("preparser failed: {0}")]
    PreparserFailure(String),

    /// Child command composition failed or no execution mode applied.
    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    /// A post-parser raised.
    #[error("postparser failed: {0}")]
    PostparserFailure(String),

    /// The completion hook raised.
    #[error("completion task failed: {0}")]
    CompletionTaskFailure(String),

    /// The on-failure hook itself raised.
    #[error("failure hook failed: {0}")]
    SetFailureFailure(String),

    /// Command input or child structure was malformed.
    #[error("malformed command data: {0}")]
    DataFormat(String),

    /// The container was externally force-completed.
    #[error("container force-completed: {0}")]
    ForceComplete(String),

    /// An error occurred in the async-ssh2-tokio library.
    #[error("ssh error: {0}")]
    Ssh(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    /// Failed to send data to the channel I/O task.
    #[error("failed to send data: {0}")]
    SendData(#[from] SendError<String>),
}

impl ToolkitError {
    /// The failure class of this error, as stored in command results.
    pub fn kind(&self) -> FailureKind {
        match self {
            ToolkitError::AuthFailure(_) => FailureKind::Auth,
            ToolkitError::ConnectionFailure(_) => FailureKind::Connection,
            ToolkitError::ChannelFailure(_) => FailureKind::Channel,
            ToolkitError::ClosedBuffer(_) => FailureKind::ClosedBuffer,
            ToolkitError::TimeToFirstBit(_) => FailureKind::TimeToFirstBit,
            ToolkitError::BetweenBits(_) => FailureKind::BetweenBits,
            ToolkitError::TotalTimeout(_) => FailureKind::TotalTimeout,
            ToolkitError::BecomeUserFailure(_) => FailureKind::BecomeUser,
            ToolkitError::RequirementsFailure(_) => FailureKind::Requirements,
            ToolkitError::PreparserFailure(_) => FailureKind::Preparser,
            ToolkitError::ExecutionFailure(_) => FailureKind::Execution,
            ToolkitError::PostparserFailure(_) => FailureKind::Postparser,
            ToolkitError::CompletionTaskFailure(_) => FailureKind::CompletionTask,
            ToolkitError::SetFailureFailure(_) => FailureKind::SetFailure,
            ToolkitError::DataFormat(_) => FailureKind::DataFormat,
            ToolkitError::ForceComplete(_) => FailureKind::ForceComplete,
            ToolkitError::Ssh(_) => FailureKind::Connection,
            ToolkitError::Russh(_) => FailureKind::Connection,
            ToolkitError::SendData(_) => FailureKind::ClosedBuffer,
        }
    }

    /// Whether this error means the underlying transport or channel is gone
    /// and the environment should be disconnected rather than reused.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            ToolkitError::ClosedBuffer(_)
                | ToolkitError::ConnectionFailure(_)
                | ToolkitError::AuthFailure(_)
                | ToolkitError::TimeToFirstBit(_)
                | ToolkitError::BetweenBits(_)
                | ToolkitError::Ssh(_)
                | ToolkitError::Russh(_)
                | ToolkitError::SendData(_)
        )
    }

    /// Whether this error is one of the buffer timeout classes.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ToolkitError::TimeToFirstBit(_)
                | ToolkitError::BetweenBits(_)
                | ToolkitError::TotalTimeout(_)
        )
    }
}

/// Failure class stored inside command results.
///
/// This mirrors [`ToolkitError`] but is small, copyable and serializable so a
/// completed container can always publish a typed failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Auth,
    Connection,
    Channel,
    ClosedBuffer,
    TimeToFirstBit,
    BetweenBits,
    TotalTimeout,
    BecomeUser,
    Requirements,
    Preparser,
    Execution,
    Postparser,
    CompletionTask,
    SetFailure,
    DataFormat,
    ForceComplete,
}

/// A typed failure value carried in a command result slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskFailure {
    /// Failure class.
    pub kind: FailureKind,
    /// Human-readable reason.
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<&ToolkitError> for TaskFailure {
    fn from(err: &ToolkitError) -> Self {
        TaskFailure {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<ToolkitError> for TaskFailure {
    fn from(err: ToolkitError) -> Self {
        TaskFailure::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_failure_classes() {
        let err = ToolkitError::TotalTimeout("sleep 5".to_string());
        assert_eq!(err.kind(), FailureKind::TotalTimeout);
        assert!(err.is_timeout());
        assert!(!err.is_transport_fatal());

        let err = ToolkitError::ClosedBuffer("mid-read".to_string());
        assert_eq!(err.kind(), FailureKind::ClosedBuffer);
        assert!(err.is_transport_fatal());
    }

    #[test]
    fn task_failure_round_trips_through_serde() {
        let failure = TaskFailure::new(FailureKind::Requirements, "disk check failed");
        let json = serde_json::to_string(&failure).expect("serialize");
        let back: TaskFailure = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, failure);
    }
}
