use std::io;

use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, CorralErr>;

#[derive(Error, Debug)]
pub enum CorralErr {
    /// The request itself is malformed: empty prompt, unknown executor,
    /// empty request id, invalid decision.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Continuation is impossible: the adapter is gone and no resume state
    /// was captured from its output.
    #[error("session cannot be resumed: no resume state available")]
    ResumeUnavailable,

    /// The adapter does not implement the requested operation (e.g. Droid
    /// `send_message`).
    #[error("operation not supported by this executor: {0}")]
    Unsupported(&'static str),

    /// Write attempted after the adapter was torn down.
    #[error("executor is closed")]
    ExecutorClosed,

    /// A JSON-RPC request missed its reply window.
    #[error("timed out waiting for the agent to reply")]
    Timeout,

    /// The reply channel was closed before the agent answered, typically
    /// because the adapter shut down while a request was in flight.
    #[error("agent connection closed before it replied")]
    ClientClosed,

    #[error("event store is closed")]
    StoreClosed,

    /// The per-session capacity cap was hit.
    #[error("event store is full")]
    StoreFull,

    #[error("failed to spawn agent process: {0}")]
    Spawn(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),

    #[error("{0}")]
    Internal(String),
}

impl CorralErr {
    /// `true` for errors caused by the caller's input rather than the
    /// harness or the agent. The embedding HTTP layer maps these to 4xx.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CorralErr::Validation(_)
                | CorralErr::NotFound(_)
                | CorralErr::ResumeUnavailable
                | CorralErr::Unsupported(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_includes_detail() {
        let err = CorralErr::Validation("prompt is required".to_string());
        assert_eq!(err.to_string(), "invalid request: prompt is required");
        assert!(err.is_client_error());
    }

    #[test]
    fn io_errors_are_not_client_errors() {
        let err = CorralErr::Io(io::Error::other("boom"));
        assert!(!err.is_client_error());
    }
}
