//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the channel.
    #[error("read beyond end of channel: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current channel size.
        size: u64,
    },

    /// The channel was closed underneath the caller.
    ///
    /// This only happens when a foreign thread interrupt closes the
    /// descriptor mid-operation, leaving file state ambiguous. Callers must
    /// treat it as unrecoverable.
    #[error("channel closed: {0}")]
    Closed(String),

    /// A named file does not exist on the device.
    #[error("no such file: {0}")]
    NotFound(String),

    /// An injected test fault fired.
    #[error("injected fault: {0}")]
    InjectedFault(String),
}

impl StorageError {
    /// Creates a closed-channel error.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed(message.into())
    }
}
