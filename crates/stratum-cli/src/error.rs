//! Error types for the CLI

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Stratum(#[from] stratum_common::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read {path}: {message}")]
    InvalidFile { path: PathBuf, message: String },

    #[error("instance deployed with warnings: {message}")]
    PartialSuccess { message: String },

    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl Error {
    pub fn invalid_file(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::InvalidFile {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn partial_success(message: impl Into<String>) -> Self {
        Error::PartialSuccess {
            message: message.into(),
        }
    }
}
