//! Error vocabulary shared by the pure core and the I/O adapters.

use std::time::Duration;

use thiserror::Error;

/// Outcome of a failed model invocation.
///
/// Every variant except [`ModelError::Cancelled`] is transient: the calling
/// cycle turns it into a rejection and spends budget on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("model process failed with exit code {exit_code:?}")]
    ProcessFailure { exit_code: Option<i32> },

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("model backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("model call cancelled")]
    Cancelled,
}

impl ModelError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ModelError::Cancelled)
    }
}

/// An event that the current phase cannot accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("event {event} does not apply to phase {phase}")]
    UnexpectedEvent {
        phase: &'static str,
        event: &'static str,
    },

    #[error("task already finished with {0}")]
    AlreadyFinished(String),

    #[error("step {0} is not part of the plan")]
    UnknownStep(usize),
}
