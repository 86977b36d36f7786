//! Channel and device trait definitions.

use crate::error::StorageResult;
use std::sync::Arc;

/// A low-level byte container with positioned access.
///
/// Channels are **opaque byte stores**. They provide positioned reads and
/// writes plus durability calls. DenLog owns all file format interpretation -
/// channels do not understand log entries, file headers, or LSNs.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `write_at` past the current end extends the channel (sparse gaps are
///   zero-filled)
/// - `sync` ensures all written data and metadata is durable
/// - Channels must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemChannel`] - For testing
/// - [`super::FsChannel`] - For persistent storage
pub trait FileChannel: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs. A [`crate::StorageError::Closed`]
    /// error means the descriptor was closed mid-operation and the on-disk
    /// state is ambiguous.
    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Flushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&self) -> StorageResult<()>;

    /// Syncs all data and metadata to durable storage (fsync).
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&self) -> StorageResult<()>;

    /// Returns the current size of the channel in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Truncates the channel to the given size.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncation fails or `new_size` exceeds the
    /// current size.
    fn truncate(&self, new_size: u64) -> StorageResult<()>;
}

/// A directory of named channels.
///
/// The device owns file lifecycle (create, rename, delete, list) within one
/// environment directory, so the engine never touches `std::fs` directly and
/// tests can run against an in-memory device.
pub trait Device: Send + Sync {
    /// Opens the named channel, creating it empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened or created.
    fn open(&self, name: &str) -> StorageResult<Arc<dyn FileChannel>>;

    /// Returns true if the named file exists on the device.
    fn exists(&self, name: &str) -> bool;

    /// Deletes the named file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be removed.
    fn delete(&self, name: &str) -> StorageResult<()>;

    /// Renames a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the source does not exist or the rename fails.
    fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Lists all file names on the device, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    fn list(&self) -> StorageResult<Vec<String>>;

    /// Syncs directory metadata so that creates, renames, and deletes are
    /// durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory fsync fails.
    fn sync_dir(&self) -> StorageResult<()>;
}
