//! Error types for Sleepwatch

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while acquiring, preparing or scoring sleep data
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    #[error("Permanent fetch error: {0}")]
    PermanentFetch(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Malformed vendor data: {0}")]
    MalformedData(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("No devices found: {0}")]
    NoDevicesFound(String),

    #[error("Cache I/O error: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error("Corrupt cache entry {key}: {reason}")]
    CacheCorrupt { key: String, reason: String },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Explanation failed: {0}")]
    Explanation(String),
}

/// Coarse error classes reported in per-device failure entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Fetch,
    Data,
    Model,
    Cache,
    Collaborator,
}

impl DetectorError {
    /// Classify the error for reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            DetectorError::Configuration(_)
            | DetectorError::Authentication(_)
            | DetectorError::NoDevicesFound(_) => ErrorKind::Configuration,
            DetectorError::TransientFetch(_) | DetectorError::PermanentFetch(_) => {
                ErrorKind::Fetch
            }
            DetectorError::InsufficientData(_)
            | DetectorError::MalformedData(_)
            | DetectorError::Json(_) => ErrorKind::Data,
            DetectorError::Model(_) => ErrorKind::Model,
            DetectorError::CacheIo(_) | DetectorError::CacheCorrupt { .. } => ErrorKind::Cache,
            DetectorError::Notification(_) | DetectorError::Explanation(_) => {
                ErrorKind::Collaborator
            }
        }
    }

    /// Whether the caller may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, DetectorError::TransientFetch(_))
    }

    /// Take back an error that was handed to several waiters at once.
    ///
    /// Variants keep their kind and retryability; wrapped I/O and JSON errors
    /// are rebuilt from their message.
    pub fn from_shared(error: Arc<DetectorError>) -> Self {
        Arc::try_unwrap(error).unwrap_or_else(|shared| match shared.as_ref() {
            DetectorError::Configuration(m) => DetectorError::Configuration(m.clone()),
            DetectorError::Authentication(m) => DetectorError::Authentication(m.clone()),
            DetectorError::TransientFetch(m) => DetectorError::TransientFetch(m.clone()),
            DetectorError::PermanentFetch(m) => DetectorError::PermanentFetch(m.clone()),
            DetectorError::InsufficientData(m) => DetectorError::InsufficientData(m.clone()),
            DetectorError::MalformedData(m) => DetectorError::MalformedData(m.clone()),
            DetectorError::Model(m) => DetectorError::Model(m.clone()),
            DetectorError::NoDevicesFound(m) => DetectorError::NoDevicesFound(m.clone()),
            DetectorError::CacheIo(e) => {
                DetectorError::CacheIo(std::io::Error::new(e.kind(), e.to_string()))
            }
            DetectorError::CacheCorrupt { key, reason } => DetectorError::CacheCorrupt {
                key: key.clone(),
                reason: reason.clone(),
            },
            DetectorError::Json(e) => DetectorError::MalformedData(e.to_string()),
            DetectorError::Notification(m) => DetectorError::Notification(m.clone()),
            DetectorError::Explanation(m) => DetectorError::Explanation(m.clone()),
        })
    }
}
