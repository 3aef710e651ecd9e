//! Error types for Strata
//!
//! This module defines the common error types used throughout the system.
//! Races between storage nodes are not errors: queue operations that hit an
//! already-retired timestamp report `Resolution::Stale` instead.

use crate::types::BucketPathError;
use thiserror::Error;

/// Common result type for Strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Strata
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    // Object errors
    #[error("object not found: {path}")]
    NotFound { path: String },

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("does not exist: {0}")]
    NotExists(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid bucket path: {0}")]
    InvalidBucketPath(#[from] BucketPathError),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a not found error for an object path
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Create an invalid path error
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    /// Report a not found error against the symbolic object path
    ///
    /// Filesystem errors name the resolved host path, which callers never see.
    #[must_use]
    pub fn for_object(self, path: impl std::fmt::Display) -> Self {
        if self.is_not_found() {
            Self::not_found(path.to_string())
        } else {
            self
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::NotExists(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Get HTTP status code for the storage node API
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidPath(_) | Self::InvalidBucketPath(_) | Self::Deserialization(_) => 400,

            // 404 Not Found
            Self::NotFound { .. } | Self::NotExists(_) => 404,

            // 409 Conflict
            Self::AlreadyExists(_) => 409,

            // 500 Internal Server Error
            Self::Io(_)
            | Self::Storage(_)
            | Self::DataCorruption(_)
            | Self::Internal(_)
            | Self::Serialization(_) => 500,

            // 503 Service Unavailable
            Self::Configuration(_) => 503,
        }
    }
}
