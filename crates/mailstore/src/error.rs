//! Error taxonomy shared by every store and repository

use thiserror::Error;

use crate::models::UploadId;

/// Errors returned by blob stores, metadata stores and repositories
#[derive(Debug, Error)]
pub enum StoreError {
    /// A caller-supplied argument was rejected before any I/O happened
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No row or blob exists for the requested key
    #[error("not found: {0}")]
    NotFound(String),

    /// The upload does not exist or belongs to another owner
    #[error("upload not found: {0}")]
    UploadNotFound(UploadId),

    /// The underlying store failed; never retried at this layer
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl StoreError {
    /// Build an `InvalidArgument` error
    pub fn invalid(message: impl Into<String>) -> Self {
        StoreError::InvalidArgument(message.into())
    }

    /// Build a `NotFound` error
    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound(what.into())
    }

    /// Whether this is one of the expected "missing" outcomes
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::UploadNotFound(_)
        )
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Storage(err.into())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Storage(err.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Storage(err.into())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Storage(anyhow::anyhow!("background task failed: {}", err))
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
