//! Error types for bucketkv
//!
//! Provides a unified error type for the storage tier and the embedded LSM engine.

use thiserror::Error;

/// Result type alias using BucketError
pub type Result<T> = std::result::Result<T, BucketError>;

/// Unified error type for bucketkv operations
#[derive(Debug, Error)]
pub enum BucketError {
    // -------------------------------------------------------------------------
    // Request Errors
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    NotFound,

    #[error("Version conflict: expected {expected}, stored {stored}")]
    VersionConflict { expected: u16, stored: u16 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Bucket {0} is not served by any instance")]
    InstanceUnavailable(u32),

    // -------------------------------------------------------------------------
    // Engine Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine IO error: {0}")]
    EngineIo(String),

    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BucketError {
    /// True for failures of the underlying store (read/write/compaction)
    pub fn is_engine_error(&self) -> bool {
        matches!(
            self,
            BucketError::Io(_)
                | BucketError::EngineIo(_)
                | BucketError::WalCorruption(_)
                | BucketError::Storage(_)
                | BucketError::Serialization(_)
        )
    }
}

impl From<bincode::Error> for BucketError {
    fn from(e: bincode::Error) -> Self {
        BucketError::Serialization(e.to_string())
    }
}
