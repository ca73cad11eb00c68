use thiserror::Error;

/// Failure taxonomy shared by the orchestrator and its HTTP surface.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The external workflow trigger was not accepted. No remote resource is assumed.
    #[error("workflow dispatch failed: {0}")]
    Dispatch(String),

    #[error("invalid or missing webhook signature")]
    Signature,

    #[error("malformed callback: {0}")]
    MalformedCallback(String),

    /// A concurrent authoritative write won the race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Start/stop/destroy against real infrastructure failed. Local state is untouched.
    #[error("{0}")]
    RemoteLifecycle(String),

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("{0}")]
    Precondition(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(String),
}

impl OrchestratorError {
    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Dispatch(_) => "dispatch_failed",
            OrchestratorError::Signature => "invalid_signature",
            OrchestratorError::MalformedCallback(_) => "malformed_callback",
            OrchestratorError::Conflict(_) => "conflict",
            OrchestratorError::RemoteLifecycle(_) => "remote_lifecycle_failed",
            OrchestratorError::Rollback(_) => "rollback_failed",
            OrchestratorError::Precondition(_) => "precondition_failed",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Validation(_) => "invalid_request",
            OrchestratorError::Store(_) => "store_error",
        }
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(e: sqlx::Error) -> Self {
        OrchestratorError::Store(e.to_string())
    }
}
