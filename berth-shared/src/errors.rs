//! Error taxonomy shared by every berth crate.

use thiserror::Error;

/// Result alias used across berth.
pub type BerthResult<T> = Result<T, BerthError>;

/// Errors surfaced by the orchestration layer.
///
/// Transient stream errors (log streaming, event monitoring) never reach
/// this type: they are retried and logged inside the background loops.
#[derive(Debug, Error)]
pub enum BerthError {
    /// The declared image or snapshot cannot be located. Not retried.
    #[error("source not found: {0}")]
    SourceNotFound(String),

    /// Build, pull, create, start or network attach failed. Any partially
    /// created container has already been removed when this is returned.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// An exec-based liveness check reported no such process.
    #[error("process not found in container {container}: {message} (command: {command:?})")]
    ProcessNotFound {
        container: String,
        command: Vec<String>,
        message: String,
    },

    /// `start` was called twice on the same process handle.
    #[error("process conflict: {0}")]
    ProcessConflict(String),

    /// Agent dependency graph contains a cycle.
    #[error("circular dependency: {0}")]
    CircularDependency(String),

    /// Snapshot save or removal failed.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Container engine call failed.
    #[error("engine error: {0}")]
    Engine(String),

    /// Exec inside a container failed. Carries the command for diagnosis.
    #[error("exec failed in container {container}: {message} (command: {command:?})")]
    Exec {
        container: String,
        command: Vec<String>,
        message: String,
    },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for BerthError {
    fn from(err: serde_json::Error) -> Self {
        BerthError::Config(format!("invalid JSON: {}", err))
    }
}

impl From<std::io::Error> for BerthError {
    fn from(err: std::io::Error) -> Self {
        BerthError::Internal(format!("I/O error: {}", err))
    }
}
