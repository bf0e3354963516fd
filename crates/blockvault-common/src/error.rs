//! Error types for BlockVault
//!
//! Host-visible failures: startup, configuration and recovery errors.
//! Per-operation results are delivered as negative errno codes through the
//! operation callback and never travel through this enum.

use thiserror::Error;

/// Common result type for BlockVault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for BlockVault
#[derive(Debug, Error)]
pub enum Error {
    #[error("device I/O error: {0}")]
    DeviceIo(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("superblock error: {0}")]
    Superblock(String),

    #[error("metadata corrupt: {0}")]
    MetadataCorrupt(String),

    #[error("journal corrupt: {0}")]
    JournalCorrupt(String),

    #[error("completion ring error: {0}")]
    Ring(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if this error indicates on-disk corruption
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::MetadataCorrupt(_) | Self::JournalCorrupt(_) | Self::Superblock(_)
        )
    }
}
