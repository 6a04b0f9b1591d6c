//! Block store error types

use crate::query::Interrupt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the block store
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Data corruption detected (checksum mismatch, bad offsets)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Block file format error (magic, version, layout)
    #[error("Invalid block format: {0}")]
    InvalidBlock(String),

    /// The dataset could not be opened
    #[error("Failed to open {path:?}: {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    /// The store was closed during shutdown
    #[error("block store is closed")]
    Closed,

    /// Iteration stopped because the owning query was interrupted
    #[error("{0}")]
    Interrupted(#[from] Interrupt),
}

impl StorageError {
    pub fn open_failed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        StorageError::OpenFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<lz4_flex::block::DecompressError> for StorageError {
    fn from(err: lz4_flex::block::DecompressError) -> Self {
        StorageError::Compression(format!("LZ4 decompression failed: {}", err))
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::open_failed("/data/missing", "directory does not exist");
        assert_eq!(
            err.to_string(),
            "Failed to open \"/data/missing\": directory does not exist"
        );

        let err = StorageError::Interrupted(Interrupt::Cancelled);
        assert_eq!(err.to_string(), "query was cancelled");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }
}
