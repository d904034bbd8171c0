use berth_shared::BerthError;
use thiserror::Error;

/// Failure reported by a container engine call.
///
/// Streaming consumers distinguish `Timeout` (reconnect) and
/// `ContainerNotFound` (stop) from everything else (count against the error budget).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine request timed out")]
    Timeout,

    #[error("container {0} not found")]
    ContainerNotFound(String),

    #[error("image {0} not found")]
    ImageNotFound(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("engine API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("engine I/O error: {0}")]
    Io(String),
}

impl EngineError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        EngineError::Api {
            status,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            EngineError::Timeout
        } else {
            EngineError::Io(err.to_string())
        }
    }
}

impl From<EngineError> for BerthError {
    fn from(err: EngineError) -> Self {
        BerthError::Engine(err.to_string())
    }
}
