//! Environment directory management.
//!
//! An environment is one directory of numbered log files plus two sentinel
//! lock files:
//!
//! ```text
//! <env_path>/
//! ├─ environment.lck   # writer-exclusive advisory lock
//! ├─ reader.lck        # shared among readers; cleaner takes it exclusively
//! ├─ 00000000.jdb      # log files, zero-padded hex file numbers
//! ├─ 00000001.jdb
//! └─ 00000002.bad      # quarantined corrupt file
//! ```
//!
//! A single writer process holds `environment.lck` exclusively. Read-only
//! processes hold it shared, and additionally hold `reader.lck` shared. The
//! cleaner pass takes `reader.lck` exclusively, so a lone reader process and
//! a writer reclaiming space can never overlap.

use crate::error::{EngineError, EngineResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Suffix of active log files.
pub const SUFFIX_LOG: &str = ".jdb";
/// Suffix of cleaned (reclaimed) log files.
pub const SUFFIX_DELETED: &str = ".del";
/// Suffix of quarantined corrupt log files.
pub const SUFFIX_CORRUPT: &str = ".bad";

const WRITER_LOCK_FILE: &str = "environment.lck";
const READER_LOCK_FILE: &str = "reader.lck";

/// Formats a log file name from its number: zero-padded 8-digit hex.
#[must_use]
pub fn log_file_name(file_num: u32) -> String {
    format!("{file_num:08x}{SUFFIX_LOG}")
}

/// Parses a log file name back to its number.
///
/// Returns `None` for anything that is not an active log file.
#[must_use]
pub fn parse_log_file_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(SUFFIX_LOG)?;
    if stem.len() != 8 {
        return None;
    }
    u32::from_str_radix(stem, 16).ok()
}

/// Lists the numbers of all active log files on a device, sorted.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed.
pub fn list_log_files(device: &dyn denlog_storage::Device) -> EngineResult<Vec<u32>> {
    let mut nums: Vec<u32> = device
        .list()?
        .iter()
        .filter_map(|name| parse_log_file_name(name))
        .collect();
    nums.sort_unstable();
    Ok(nums)
}

/// Renames a log file to carry the given suffix, appending a numeric
/// collision suffix (`.1`, `.2`, ...) when the target name already exists.
///
/// Returns the name the file ended up with.
///
/// # Errors
///
/// Returns an error if the rename fails.
pub fn rename_with_suffix(
    device: &dyn denlog_storage::Device,
    file_num: u32,
    suffix: &str,
) -> EngineResult<String> {
    let from = log_file_name(file_num);
    let base = format!("{file_num:08x}{suffix}");
    let mut target = base.clone();
    let mut attempt = 0u32;
    while device.exists(&target) {
        attempt += 1;
        target = format!("{base}.{attempt}");
    }
    device.rename(&from, &target)?;
    device.sync_dir()?;
    Ok(target)
}

/// Mode an environment directory is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvMode {
    /// Single writer with exclusive access.
    ReadWrite,
    /// Shared reader.
    ReadOnly,
}

/// An opened, locked environment directory.
///
/// Holds the advisory locks for the lifetime of the value; dropping it
/// releases them.
#[derive(Debug)]
pub struct EnvDir {
    path: PathBuf,
    mode: EnvMode,
    _writer_lock: File,
    reader_lock: File,
}

impl EnvDir {
    /// Opens or creates an environment directory and takes the locks
    /// appropriate for `mode`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds a conflicting lock (`EnvironmentLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, mode: EnvMode, create_if_missing: bool) -> EngineResult<Self> {
        if !path.exists() {
            if create_if_missing && mode == EnvMode::ReadWrite {
                fs::create_dir_all(path)?;
            } else {
                return Err(EngineError::invalid_config(format!(
                    "environment directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(EngineError::invalid_config(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let writer_lock = open_lock_file(&path.join(WRITER_LOCK_FILE))?;
        let reader_lock = open_lock_file(&path.join(READER_LOCK_FILE))?;

        match mode {
            EnvMode::ReadWrite => {
                if writer_lock.try_lock_exclusive().is_err() {
                    return Err(EngineError::EnvironmentLocked);
                }
            }
            EnvMode::ReadOnly => {
                if writer_lock.try_lock_shared().is_err() {
                    return Err(EngineError::EnvironmentLocked);
                }
                if reader_lock.try_lock_shared().is_err() {
                    return Err(EngineError::EnvironmentLocked);
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            mode,
            _writer_lock: writer_lock,
            reader_lock,
        })
    }

    /// Returns the environment path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the mode this environment was opened in.
    #[must_use]
    pub fn mode(&self) -> EnvMode {
        self.mode
    }

    /// Enters the space-reclamation critical section.
    ///
    /// The cleaner must not run while a lone reader process is scanning, so
    /// it takes the shared-reader lock exclusively for the duration of the
    /// pass. Blocks until any readers release it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired.
    pub fn cleaner_guard(&self) -> EngineResult<CleanerGuard<'_>> {
        self.reader_lock.lock_exclusive().map_err(EngineError::Io)?;
        Ok(CleanerGuard { env: self })
    }
}

/// RAII guard for the cleaner's exclusive hold on the reader region.
#[derive(Debug)]
pub struct CleanerGuard<'a> {
    env: &'a EnvDir,
}

impl Drop for CleanerGuard<'_> {
    fn drop(&mut self) {
        // Best effort; the lock also dies with the file handle.
        let _ = fs2::FileExt::unlock(&self.env.reader_lock);
    }
}

fn open_lock_file(path: &Path) -> EngineResult<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use denlog_storage::{Device, MemDevice};
    use tempfile::tempdir;

    #[test]
    fn file_name_roundtrip() {
        assert_eq!(log_file_name(0), "00000000.jdb");
        assert_eq!(log_file_name(0xAB), "000000ab.jdb");
        assert_eq!(parse_log_file_name("000000ab.jdb"), Some(0xAB));
        assert_eq!(parse_log_file_name("000000ab.del"), None);
        assert_eq!(parse_log_file_name("ab.jdb"), None);
        assert_eq!(parse_log_file_name("zzzzzzzz.jdb"), None);
    }

    #[test]
    fn list_skips_non_log_files() {
        let device = MemDevice::new();
        device.open("00000002.jdb").unwrap();
        device.open("00000000.jdb").unwrap();
        device.open("00000001.del").unwrap();
        device.open("garbage.txt").unwrap();

        assert_eq!(list_log_files(&device).unwrap(), vec![0, 2]);
    }

    #[test]
    fn rename_appends_collision_suffix() {
        let device = MemDevice::new();
        device.open("00000003.jdb").unwrap();
        device.open("00000003.bad").unwrap();

        let target = rename_with_suffix(&device, 3, SUFFIX_CORRUPT).unwrap();
        assert_eq!(target, "00000003.bad.1");
        assert!(!device.exists("00000003.jdb"));
    }

    #[test]
    fn writer_lock_excludes_second_writer() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("env");

        let _env = EnvDir::open(&path, EnvMode::ReadWrite, true).unwrap();
        let second = EnvDir::open(&path, EnvMode::ReadWrite, true);
        assert!(matches!(second, Err(EngineError::EnvironmentLocked)));
    }

    #[test]
    fn writer_lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("env");

        {
            let _env = EnvDir::open(&path, EnvMode::ReadWrite, true).unwrap();
        }
        let _env2 = EnvDir::open(&path, EnvMode::ReadWrite, true).unwrap();
    }

    #[test]
    fn readers_share_but_exclude_writer() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("env");
        // Seed the directory with a writer first.
        drop(EnvDir::open(&path, EnvMode::ReadWrite, true).unwrap());

        let _r1 = EnvDir::open(&path, EnvMode::ReadOnly, false).unwrap();
        let _r2 = EnvDir::open(&path, EnvMode::ReadOnly, false).unwrap();

        let writer = EnvDir::open(&path, EnvMode::ReadWrite, false);
        assert!(matches!(writer, Err(EngineError::EnvironmentLocked)));
    }

    #[test]
    fn read_only_requires_existing_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("missing");
        let result = EnvDir::open(&path, EnvMode::ReadOnly, true);
        assert!(result.is_err());
    }

    #[test]
    fn cleaner_guard_roundtrip() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("env");
        let env = EnvDir::open(&path, EnvMode::ReadWrite, true).unwrap();

        {
            let _guard = env.cleaner_guard().unwrap();
        }
        // Re-acquirable after drop.
        let _guard2 = env.cleaner_guard().unwrap();
    }
}
