//! Error types for the log engine.

use crate::lsn::Lsn;
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in log engine operations.
///
/// Variants fall into four severities:
///
/// - **Format/checksum corruption** (`Corrupt`, `ChecksumMismatch`,
///   `UnsupportedVersion`) - the durable log cannot be trusted; always fatal
///   during normal operation.
/// - **Channel-closed I/O** (`ChannelClosed`) - only produced by a foreign
///   thread interrupt, leaves file state ambiguous; always fatal.
/// - **Ordinary I/O** (`Io`, `Storage`) - disk-full and friends; surfaced to
///   the caller without invalidating the engine.
/// - **Startup configuration** (`InvalidConfig`, `EnvironmentLocked`) -
///   reported at open, never retried.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage device error.
    #[error("storage error: {0}")]
    Storage(denlog_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A log record is structurally invalid (bad type number, impossible
    /// size, broken prev-offset chain).
    #[error("log corruption at {lsn}: {message}")]
    Corrupt {
        /// Where the corruption was detected.
        lsn: Lsn,
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected while reading a record.
    #[error("checksum mismatch at {lsn}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Where the mismatch was detected.
        lsn: Lsn,
        /// Checksum stored in the record header.
        expected: u32,
        /// Checksum computed over the record bytes.
        actual: u32,
    },

    /// A log file carries a format version newer than this build supports.
    #[error("unsupported log format version {found} (supported up to {supported})")]
    UnsupportedVersion {
        /// Version found on disk.
        found: u8,
        /// Newest version this build understands.
        supported: u8,
    },

    /// The channel was closed underneath an in-flight operation.
    #[error("log channel closed: {message}")]
    ChannelClosed {
        /// Description of the condition.
        message: String,
    },

    /// A scan crossed into a log file that has been cleaned away.
    ///
    /// Reverse scans raise this by default; callers that expect to walk
    /// over reclaimed history opt into stopping cleanly instead.
    #[error("log file {file_num:#010x} has been cleaned away")]
    FileCleaned {
        /// Number of the missing file.
        file_num: u32,
    },

    /// Another process holds the environment lock.
    #[error("environment locked: another process has exclusive access")]
    EnvironmentLocked,

    /// Invalid combination of tuning parameters.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        message: String,
    },

    /// The engine was invalidated by an earlier fatal error.
    ///
    /// Every operation after invalidation fails fast with this variant
    /// rather than attempting further I/O.
    #[error("log engine invalidated: {message}")]
    Invalidated {
        /// The terminal error that invalidated the engine.
        message: String,
    },
}

impl From<denlog_storage::StorageError> for EngineError {
    fn from(err: denlog_storage::StorageError) -> Self {
        match err {
            denlog_storage::StorageError::Closed(message) => Self::ChannelClosed { message },
            other => Self::Storage(other),
        }
    }
}

impl EngineError {
    /// Creates a corruption error.
    pub fn corrupt(lsn: Lsn, message: impl Into<String>) -> Self {
        Self::Corrupt {
            lsn,
            message: message.into(),
        }
    }

    /// Creates an invalid-configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns true if this error must invalidate the whole engine.
    ///
    /// Corruption and channel-closed conditions mean the durable log or the
    /// cursor state can no longer be trusted. Ordinary I/O errors (disk
    /// full) and startup errors do not poison the engine.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. }
                | Self::ChecksumMismatch { .. }
                | Self::UnsupportedVersion { .. }
                | Self::ChannelClosed { .. }
                | Self::Invalidated { .. }
        )
    }

    /// Returns true for corruption-class errors (bad framing or checksum).
    ///
    /// The end-of-log probe treats these as a clean scan terminator instead
    /// of propagating them.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. } | Self::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_is_fatal() {
        let err = EngineError::corrupt(Lsn::new(0, 100), "bad type");
        assert!(err.is_fatal());
        assert!(err.is_corruption());
    }

    #[test]
    fn io_error_is_not_fatal() {
        let err = EngineError::Io(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert!(!err.is_fatal());
        assert!(!err.is_corruption());
    }

    #[test]
    fn closed_channel_converts_to_fatal() {
        let err: EngineError = denlog_storage::StorageError::closed("00000000.jdb").into();
        assert!(matches!(err, EngineError::ChannelClosed { .. }));
        assert!(err.is_fatal());
    }
}
