//! Orchestrator error type and its classification for callers.

use tenantry_core::SlugError;
use tenantry_runtime::{FleetError, RunnerError};
use tenantry_secrets::CipherError;
use tenantry_state::StateError;
use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Slug(#[from] SlugError),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// A provisioning step exited non-zero or produced unusable output.
    #[error("{0}")]
    Workflow(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Coarse classification used to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Forbidden,
    NotFound,
    ExternalTool,
    Internal,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Slug(_) | OrchestratorError::Validation(_) => ErrorKind::Validation,
            OrchestratorError::Conflict(_) => ErrorKind::Conflict,
            OrchestratorError::Forbidden(_) => ErrorKind::Forbidden,
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::State(StateError::NotFound(_)) => ErrorKind::NotFound,
            OrchestratorError::State(StateError::Conflict(_)) => ErrorKind::Conflict,
            OrchestratorError::Fleet(FleetError::InvalidService(_)) => ErrorKind::Validation,
            OrchestratorError::Fleet(FleetError::NotFound(_)) => ErrorKind::NotFound,
            OrchestratorError::Fleet(FleetError::ExternalTool { .. }) => ErrorKind::ExternalTool,
            _ => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let slug = tenantry_core::TenantSlug::parse("1abc").unwrap_err();
        assert_eq!(OrchestratorError::from(slug).kind(), ErrorKind::Validation);
        assert_eq!(
            OrchestratorError::from(StateError::Conflict("tenant x".into())).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            OrchestratorError::from(StateError::NotFound("tenant x".into())).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            OrchestratorError::from(FleetError::ExternalTool {
                command: "docker ps -a".into(),
                exit_code: 1,
                stderr: String::new(),
            })
            .kind(),
            ErrorKind::ExternalTool
        );
        assert_eq!(
            OrchestratorError::from(StateError::Database("boom".into())).kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            OrchestratorError::Configuration("x".into()).kind(),
            ErrorKind::Internal
        );
    }
}
