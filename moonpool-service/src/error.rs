//! Error types for the service runtime.

use crate::task::{SuspendTrace, TaskHandle};
use crate::types::{Address, SessionId, TimerId};
use thiserror::Error;

/// Failure reported by a remote service.
///
/// Delivered to a waiting caller as a recoverable result, never as a crash.
/// Produced by an inbound `error` protocol message or by the death of the
/// service a call was watching.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteError {
    /// Human-readable failure description.
    pub message: String,
}

impl RemoteError {
    /// Create a remote error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors raised by the service runtime.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No protocol registered under this tag or name.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Tag 0 cannot be registered.
    #[error("protocol tag 0 is reserved")]
    ReservedProtocolTag,

    /// The protocol has no fire-and-forget handler.
    #[error("protocol '{protocol}' has no dispatch handler")]
    DispatchNotImplemented {
        /// Name of the protocol.
        protocol: String,
    },

    /// A response arrived for a session nobody is waiting on.
    #[error("response for session {0} has no waiter")]
    UnmatchedResponse(SessionId),

    /// The remote side failed the call.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A task body returned an error or panicked.
    #[error("task {task} faulted: {reason}{trace}")]
    TaskFault {
        /// The discarded task.
        task: TaskHandle,
        /// Error or panic message raised by the body.
        reason: String,
        /// Every place the task suspended before faulting.
        trace: SuspendTrace,
    },

    /// A freshly allocated session id is still live.
    #[error("session {0} allocated while still live")]
    SessionCollision(SessionId),

    /// A freshly allocated timer id is still live.
    #[error("timer {0} allocated while still live")]
    TimerCollision(TimerId),

    /// The operation must run inside a task.
    #[error("operation requires a running task")]
    NotInTask,

    /// The task is currently running and cannot be resumed.
    #[error("task {0} is already running")]
    TaskBusy(TaskHandle),

    /// The task handle no longer names a suspended task.
    #[error("task {0} is not suspended")]
    StaleTask(TaskHandle),

    /// The transport could not create the requested service.
    #[error("failed to spawn service '{0}'")]
    SpawnFailed(String),

    /// The service has already quit.
    #[error("service {0} has exited")]
    ServiceExited(Address),

    /// Packing or unpacking values failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The transport rejected an operation.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ServiceError {
    /// Whether this error is a remote failure rather than a local fault.
    pub fn is_remote(&self) -> bool {
        matches!(self, ServiceError::Remote(_))
    }

    /// The remote failure, if this is one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            ServiceError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Codec(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = ServiceError::from(RemoteError::new("service exited"));
        assert!(err.is_remote());
        assert_eq!(err.to_string(), "remote error: service exited");
        assert_eq!(err.as_remote().map(|r| r.message.as_str()), Some("service exited"));
    }

    #[test]
    fn test_local_errors_are_not_remote() {
        let err = ServiceError::UnmatchedResponse(SessionId::new(12));
        assert!(!err.is_remote());
        assert_eq!(err.to_string(), "response for session 12 has no waiter");
    }

    #[test]
    fn test_codec_from_serde() {
        let parse: std::result::Result<Vec<u8>, _> = serde_json::from_str("not json");
        let err = ServiceError::from(parse.unwrap_err());
        assert!(matches!(err, ServiceError::Codec(_)));
    }
}
