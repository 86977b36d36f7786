//! Filesystem-backed device for persistent storage.

use crate::channel::{Device, FileChannel};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A file-backed channel.
///
/// Provides positioned access over one OS file. Data survives process
/// restarts once [`FileChannel::sync`] has returned.
///
/// # Thread Safety
///
/// The channel is thread-safe; internal locking serializes access to the
/// seek position.
#[derive(Debug)]
pub struct FsChannel {
    path: PathBuf,
    file: RwLock<Option<File>>,
}

impl FsChannel {
    /// Opens or creates a channel at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(Some(file)),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileChannel for FsChannel {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut guard = self.file.write();
        let file = guard
            .as_mut()
            .ok_or_else(|| StorageError::closed(self.path.display().to_string()))?;

        let size = file.metadata()?.len();
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut guard = self.file.write();
        let file = guard
            .as_mut()
            .ok_or_else(|| StorageError::closed(self.path.display().to_string()))?;

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        let mut guard = self.file.write();
        let file = guard
            .as_mut()
            .ok_or_else(|| StorageError::closed(self.path.display().to_string()))?;
        file.flush()?;
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        let guard = self.file.write();
        let file = guard
            .as_ref()
            .ok_or_else(|| StorageError::closed(self.path.display().to_string()))?;
        file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        let guard = self.file.read();
        let file = guard
            .as_ref()
            .ok_or_else(|| StorageError::closed(self.path.display().to_string()))?;
        Ok(file.metadata()?.len())
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        let guard = self.file.write();
        let file = guard
            .as_ref()
            .ok_or_else(|| StorageError::closed(self.path.display().to_string()))?;

        let size = file.metadata()?.len();
        if new_size > size {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot truncate to {new_size} past current size {size}"),
            )));
        }
        file.set_len(new_size)?;
        file.sync_all()?;
        Ok(())
    }
}

/// A filesystem-backed device over one directory.
#[derive(Debug)]
pub struct FsDevice {
    dir: PathBuf,
}

impl FsDevice {
    /// Opens a device over the given directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Returns the directory this device manages.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Device for FsDevice {
    fn open(&self, name: &str) -> StorageResult<Arc<dyn FileChannel>> {
        Ok(Arc::new(FsChannel::open(&self.dir.join(name))?))
    }

    fn exists(&self, name: &str) -> bool {
        self.dir.join(name).exists()
    }

    fn delete(&self, name: &str) -> StorageResult<()> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let src = self.dir.join(from);
        if !src.exists() {
            return Err(StorageError::NotFound(from.to_string()));
        }
        fs::rename(src, self.dir.join(to))?;
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// On Unix, fsync on a directory syncs the directory entries. Windows
    /// NTFS journaling provides equivalent metadata durability, so the
    /// explicit fsync is skipped there.
    #[cfg(unix)]
    fn sync_dir(&self) -> StorageResult<()> {
        let dir = File::open(&self.dir)?;
        dir.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> StorageResult<()> {
        Ok(())
    }
}
