use thiserror::Error;

/// The error taxonomy shared by every layer of the ingestion pipeline.
///
/// `ConfigError` and the two ID/operation-support errors are never retried.
/// `TransientError` is expected to be retried by the caller; once retries are
/// exhausted it should be converted into a `Backend` error.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Transient error: {0}")]
    Transient(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Unsupported id: {0}")]
    IdNotSupported(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Config load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the caller is expected to retry the operation that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Transient(_))
    }
}
