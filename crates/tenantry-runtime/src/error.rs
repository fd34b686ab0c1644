//! Error types for process execution and container fleet control.

use std::time::Duration;

use thiserror::Error;

/// Failure to run an external process at all. A non-zero exit is not an
/// error at this layer.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {after:?}")]
    TimedOut { program: String, after: Duration },

    #[error("i/o error waiting for {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("`{command}` exited with {exit_code}: {stderr}")]
    ExternalTool {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("invalid service name {0:?}: use lowercase letters, digits, '-' or '_'")]
    InvalidService(String),
}
