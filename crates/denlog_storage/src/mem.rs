//! In-memory device for testing.

use crate::channel::{Device, FileChannel};
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// I/O call counters shared by every channel of a [`MemDevice`].
///
/// Tests assert on these to prove properties like "a buffer-pool hit never
/// touches the file layer".
#[derive(Debug, Default)]
pub struct DeviceStats {
    /// Number of `read_at` calls across all channels.
    pub reads: AtomicU64,
    /// Number of `write_at` calls across all channels.
    pub writes: AtomicU64,
    /// Number of `sync` calls across all channels.
    pub syncs: AtomicU64,
}

impl DeviceStats {
    /// Returns the read count.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Returns the write count.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Returns the sync count.
    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct MemFile {
    data: RwLock<Vec<u8>>,
}

/// An in-memory channel.
///
/// Suitable for unit tests, integration tests, and ephemeral environments
/// that don't need persistence. Channels opened from the same [`MemDevice`]
/// under the same name share contents, so "reopening a file" behaves like
/// the filesystem.
#[derive(Debug)]
pub struct MemChannel {
    name: String,
    file: Arc<MemFile>,
    stats: Arc<DeviceStats>,
    fail_next_write: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemChannel {
    /// Simulates a foreign-thread interrupt closing the descriptor.
    ///
    /// Every subsequent operation fails with [`StorageError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::closed(self.name.clone()));
        }
        Ok(())
    }
}

impl FileChannel for MemChannel {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.check_open()?;
        self.stats.reads.fetch_add(1, Ordering::SeqCst);

        let data = self.file.data.read();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);
        if end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(data[start..end].to_vec())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        self.check_open()?;
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StorageError::InjectedFault(format!(
                "write_at({offset}) on {}",
                self.name
            )));
        }
        self.stats.writes.fetch_add(1, Ordering::SeqCst);

        let mut data = self.file.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        self.check_open()
    }

    fn sync(&self) -> StorageResult<()> {
        self.check_open()?;
        self.stats.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        self.check_open()?;
        Ok(self.file.data.read().len() as u64)
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        self.check_open()?;
        let mut data = self.file.data.write();
        let current = data.len() as u64;
        if new_size > current {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot truncate to {new_size} past current size {current}"),
            )));
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}

/// An in-memory device.
///
/// # Fault injection
///
/// [`MemDevice::fail_next_write`] arms a one-shot fault: the next `write_at`
/// on any channel fails with [`StorageError::InjectedFault`] without
/// modifying any bytes. Tests use this to simulate a crash between LSN
/// reservation and the buffer copy.
#[derive(Debug, Default)]
pub struct MemDevice {
    files: Mutex<HashMap<String, Arc<MemFile>>>,
    stats: Arc<DeviceStats>,
    fail_next_write: Arc<AtomicBool>,
}

impl MemDevice {
    /// Creates a new empty device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared I/O counters.
    #[must_use]
    pub fn stats(&self) -> Arc<DeviceStats> {
        Arc::clone(&self.stats)
    }

    /// Arms a one-shot write fault on the next `write_at` of any channel.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Returns a copy of a file's raw bytes, for corruption-injection tests.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the file does not exist.
    pub fn raw_bytes(&self, name: &str) -> StorageResult<Vec<u8>> {
        let files = self.files.lock();
        let file = files
            .get(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        let bytes = file.data.read().clone();
        Ok(bytes)
    }

    /// Overwrites a file's raw bytes, for corruption-injection tests.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the file does not exist.
    pub fn set_raw_bytes(&self, name: &str, bytes: Vec<u8>) -> StorageResult<()> {
        let files = self.files.lock();
        let file = files
            .get(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        *file.data.write() = bytes;
        Ok(())
    }

    /// Opens the named channel as its concrete type.
    ///
    /// Tests use this to reach [`MemChannel::close`].
    ///
    /// # Errors
    ///
    /// Never fails in practice; kept fallible for symmetry with
    /// [`Device::open`].
    pub fn open_mem(&self, name: &str) -> StorageResult<Arc<MemChannel>> {
        let mut files = self.files.lock();
        let file = files
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemFile::default()));
        Ok(Arc::new(MemChannel {
            name: name.to_string(),
            file: Arc::clone(file),
            stats: Arc::clone(&self.stats),
            fail_next_write: Arc::clone(&self.fail_next_write),
            closed: AtomicBool::new(false),
        }))
    }
}

impl Device for MemDevice {
    fn open(&self, name: &str) -> StorageResult<Arc<dyn FileChannel>> {
        let mut files = self.files.lock();
        let file = files
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemFile::default()));
        Ok(Arc::new(MemChannel {
            name: name.to_string(),
            file: Arc::clone(file),
            stats: Arc::clone(&self.stats),
            fail_next_write: Arc::clone(&self.fail_next_write),
            closed: AtomicBool::new(false),
        }))
    }

    fn exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete(&self, name: &str) -> StorageResult<()> {
        self.files
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let mut files = self.files.lock();
        let file = files
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        files.insert(to.to_string(), file);
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn sync_dir(&self) -> StorageResult<()> {
        Ok(())
    }
}
