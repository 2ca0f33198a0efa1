use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum GateError {
    #[error("Rate limited by '{key}': {message}")]
    RateLimited { key: String, message: String },

    #[error("Request to '{key}' timed out: {message}")]
    Timeout { key: String, message: String },

    #[error("Task execution failed: {0}")]
    Execution(String),

    #[error("Task '{0}' was aborted")]
    Aborted(String),

    #[error("Coordination I/O failed at {path}: {source}")]
    CoordinationIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state file {path}: {message}")]
    PersistenceCorruption { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification of a provider error, used as a learning signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Timeout,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "429",
            Self::Timeout => "timeout",
            Self::Other => "error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
