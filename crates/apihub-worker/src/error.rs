//! Error types for the build worker

use apihub_common::error::codes;
use thiserror::Error;

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Error, Debug)]
pub enum WorkerError {
    /// Transport failure talking to the server
    #[error("Network request failed: {0}. Check APIHUB_SERVER_URL and that the server is reachable.")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error envelope
    #[error("Server rejected request ({status} {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The parser exited unsuccessfully or produced an unreadable artifact
    #[error("Parser failed: {0}")]
    Parser(String),

    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode or decode JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration is missing or invalid
    #[error("Configuration error: {0}. Check your environment variables.")]
    Config(String),
}

impl WorkerError {
    pub fn parser(msg: impl Into<String>) -> Self {
        Self::Parser(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Error code returned by the server, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// The server no longer considers this worker the owner of the build.
    /// Retrying the same request cannot succeed.
    pub fn is_lease_lost(&self) -> bool {
        [
            codes::BUILD_LEASE_LOST,
            codes::BUILD_ALREADY_FINISHED,
            codes::BUILD_NOT_FOUND,
        ]
        .iter()
        .any(|c| self.code() == Some(c.code))
    }
}
