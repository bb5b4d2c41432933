//! Error types for Cairn
//!
//! This module defines the common error types used throughout the engine.

use crate::mode::Mode;
use crate::types::Address;
use thiserror::Error;

/// Common result type for Cairn operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Cairn
#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("object not found: {0}")]
    NotFound(Address),

    #[error("object already removed: {0}")]
    AlreadyRemoved(Address),

    #[error("object is expired: {0}")]
    Expired(Address),

    // Mode errors
    #[error("shard is in read-only mode")]
    ReadOnly,

    #[error("shard is in degraded mode")]
    Degraded,

    #[error("shard is disabled")]
    ShardDisabled,

    #[error("invalid mode transition: {from} -> {to}")]
    InvalidModeTransition { from: Mode, to: Mode },

    #[error("shard must be in read-only mode")]
    MustBeReadOnly,

    // Integrity errors
    #[error("data corruption detected: {0}")]
    Corruption(String),

    #[error("object validation failed: {0}")]
    Validation(String),

    #[error("invalid dump magic")]
    InvalidMagic,

    #[error("metabase version {found} is not supported (expected {expected})")]
    OutdatedVersion { found: u64, expected: u64 },

    // Lock errors
    #[error("lock target is not a regular object: {0}")]
    LockNonRegular(Address),

    #[error("lock object cannot be removed by a tombstone: {0}")]
    LockObjectRemoval(Address),

    // Write-cache rejections
    #[error("write-cache is read-only")]
    CacheReadOnly,

    #[error("object is too big for write-cache: {size} > {max} bytes")]
    CacheObjectTooBig { size: u64, max: u64 },

    #[error("write-cache is full")]
    CacheFull,

    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

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

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if the object was logically removed
    #[must_use]
    pub const fn is_removed(&self) -> bool {
        matches!(self, Self::AlreadyRemoved(_))
    }

    /// Check if the operation was refused because of the current mode
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::ReadOnly | Self::Degraded | Self::ShardDisabled | Self::MustBeReadOnly
        )
    }

    /// Check if the error signals damaged storage
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }

    /// Check if the write-cache refused an object the caller must store elsewhere
    #[must_use]
    pub const fn is_cache_rejection(&self) -> bool {
        matches!(
            self,
            Self::CacheReadOnly | Self::CacheObjectTooBig { .. } | Self::CacheFull
        )
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            Self::ReadOnly | Self::Degraded => true,
            _ => false,
        }
    }

    /// Check if this is an unexpected end of stream
    #[must_use]
    pub fn is_unexpected_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}
