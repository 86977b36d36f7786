//! The log manager: the single append serialization point, durable reads,
//! group-committed fsync, and engine invalidation.

use crate::config::Config;
use crate::envdir::{list_log_files, EnvDir, EnvMode};
use crate::error::{EngineError, EngineResult};
use crate::log::buffer_pool::LogBufferPool;
use crate::log::entry::{
    encode_vlsn, finalize_frame, rewrite_commit_as_abort, LogEntryHeader, LogEntryType,
    Provisional, LOG_ENTRY_HEADER_SIZE,
};
use crate::log::file_manager::FileManager;
use crate::log::reader::{
    find_end_of_log, parse_entry_from, read_entry_at, BackwardScanner, FileReader, ScannedEntry,
};
use crate::lsn::Lsn;
use denlog_storage::{Device, FsDevice};
use parking_lot::{Condvar, Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Sink for live/obsolete accounting, fed under the append latch so counts
/// stay exact with respect to append order.
pub trait UtilizationTracker: Send + Sync {
    /// A new entry was appended at `lsn`.
    fn count_new_entry(&self, lsn: Lsn, entry_type: LogEntryType, size: usize);
    /// A previously live entry became obsolete.
    fn count_obsolete(&self, lsn: Lsn, entry_type: LogEntryType);
}

/// Woken when enough bytes have been appended since the last wakeup that a
/// checkpoint is due.
pub trait CheckpointMonitor: Send + Sync {
    /// `bytes` have accumulated since the previous wakeup.
    fn wakeup(&self, bytes: u64);
}

/// One append request.
#[derive(Debug, Clone, Copy)]
pub struct Append<'a> {
    /// The entry kind.
    pub entry_type: LogEntryType,
    /// Recovery-filtering policy.
    pub provisional: Provisional,
    /// Whether to assign a replication sequence and set the replicated bit.
    pub replicated: bool,
    /// Marshalled item bytes.
    pub item: &'a [u8],
    /// Force the entry into a brand-new file.
    pub force_new_file: bool,
    /// Write the entry through to the operating system before returning.
    pub flush: bool,
    /// Make the entry durable before returning, via the group-commit
    /// fsync path.
    pub fsync: bool,
    /// Entry made obsolete by this one, reported to the utilization
    /// tracker.
    pub obsoletes: Option<Lsn>,
}

impl<'a> Append<'a> {
    /// A plain, non-provisional, non-replicated append.
    #[must_use]
    pub fn new(entry_type: LogEntryType, item: &'a [u8]) -> Self {
        Self {
            entry_type,
            provisional: Provisional::No,
            replicated: false,
            item,
            force_new_file: false,
            flush: false,
            fsync: false,
            obsoletes: None,
        }
    }

    /// Sets the provisional policy.
    #[must_use]
    pub fn provisional(mut self, provisional: Provisional) -> Self {
        self.provisional = provisional;
        self
    }

    /// Marks the entry replicated; a VLSN is assigned under the latch.
    #[must_use]
    pub fn replicated(mut self) -> Self {
        self.replicated = true;
        self
    }

    /// Forces a file flip before this entry.
    #[must_use]
    pub fn force_new_file(mut self) -> Self {
        self.force_new_file = true;
        self
    }

    /// Requests a write-through to the operating system as part of the
    /// append.
    #[must_use]
    pub fn flush(mut self) -> Self {
        self.flush = true;
        self
    }

    /// Requests durability as part of the append: the call returns only
    /// once the entry is fsynced.
    #[must_use]
    pub fn fsync(mut self) -> Self {
        self.fsync = true;
        self
    }

    /// Reports `lsn` obsolete alongside this append.
    #[must_use]
    pub fn obsoletes(mut self, lsn: Lsn) -> Self {
        self.obsoletes = Some(lsn);
        self
    }
}

struct SyncState {
    syncing: bool,
    last_synced: Option<Lsn>,
}

/// The write-side state mutated only under the append latch.
struct WriteState {
    next_vlsn: u64,
    bytes_since_wakeup: u64,
}

/// The log engine's central coordinator.
///
/// All appends funnel through one latch, which is where LSNs are assigned,
/// VLSNs sequenced, and utilization counted. Reads are latch-free against
/// the buffer pool and fall back to positioned file reads. A fatal error
/// invalidates the whole engine; every subsequent call fails fast.
pub struct LogManager {
    config: Config,
    file_manager: Arc<FileManager>,
    buffer_pool: LogBufferPool,
    /// The append serialization point.
    write_latch: Mutex<WriteState>,
    sync_state: Mutex<SyncState>,
    sync_cond: Condvar,
    tracker: RwLock<Option<Arc<dyn UtilizationTracker>>>,
    checkpoint_monitor: RwLock<Option<Arc<dyn CheckpointMonitor>>>,
    invalidated: RwLock<Option<String>>,
    /// Keeps the environment's advisory locks alive; `None` when opened
    /// over a bare device.
    _env: Option<EnvDir>,
}

impl LogManager {
    /// Opens a log over a device: locates the end of the log, truncates any
    /// torn tail (unless read-only), and positions the append cursor.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration, unreadable log state, or
    /// a too-new format version.
    pub fn open(device: Arc<dyn Device>, config: Config) -> EngineResult<Self> {
        config.validate()?;
        let file_manager = Arc::new(FileManager::new(device, &config));
        let end = find_end_of_log(&file_manager, &config, !config.read_only)?;
        info!(
            next = %end.next_lsn,
            last_used = %end.last_used_lsn,
            files = end.files.len(),
            "log opened"
        );
        file_manager.set_position(end.next_lsn, end.prev_offset, end.last_used_lsn);
        let buffer_pool = LogBufferPool::new(Arc::clone(&file_manager), &config);
        Ok(Self {
            config,
            file_manager,
            buffer_pool,
            write_latch: Mutex::new(WriteState {
                next_vlsn: 1,
                bytes_since_wakeup: 0,
            }),
            sync_state: Mutex::new(SyncState {
                syncing: false,
                last_synced: None,
            }),
            sync_cond: Condvar::new(),
            tracker: RwLock::new(None),
            checkpoint_monitor: RwLock::new(None),
            invalidated: RwLock::new(None),
            _env: None,
        })
    }

    /// Opens a log environment at a filesystem path, taking the advisory
    /// locks appropriate for the configured mode.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::EnvironmentLocked`] if another process holds
    /// a conflicting lock, plus every condition of [`LogManager::open`].
    pub fn open_path(path: &Path, config: Config) -> EngineResult<Self> {
        let mode = if config.read_only {
            EnvMode::ReadOnly
        } else {
            EnvMode::ReadWrite
        };
        let env = EnvDir::open(path, mode, config.create_if_missing)?;
        let device = Arc::new(FsDevice::open(env.path()).map_err(EngineError::Storage)?);
        let mut manager = Self::open(device, config)?;
        manager._env = Some(env);
        Ok(manager)
    }

    /// Installs the live/obsolete accounting sink.
    pub fn set_utilization_tracker(&self, tracker: Arc<dyn UtilizationTracker>) {
        *self.tracker.write() = Some(tracker);
    }

    /// Installs the checkpoint wakeup sink.
    pub fn set_checkpoint_monitor(&self, monitor: Arc<dyn CheckpointMonitor>) {
        *self.checkpoint_monitor.write() = Some(monitor);
    }

    /// Returns the LSN of the last appended entry.
    #[must_use]
    pub fn last_used_lsn(&self) -> Lsn {
        self.file_manager.last_used_lsn()
    }

    /// Returns where the next append will land.
    #[must_use]
    pub fn next_available_lsn(&self) -> Lsn {
        self.file_manager.next_available_lsn()
    }

    /// Returns the file manager, for cleaner and recovery collaborators.
    #[must_use]
    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.file_manager
    }

    /// Appends one entry and returns its LSN.
    ///
    /// Entry types whose on-disk image doesn't depend on latch-assigned
    /// state are framed before the latch is taken; the rest (commits,
    /// replicated entries and friends) are framed inside it. A write
    /// failure rolls the cursor back so no LSN gap is left, except for
    /// commits, whose bytes may already be partially durable: those are
    /// rewritten in place as aborts so a later recovery cannot honor a
    /// half-written commit.
    ///
    /// Requests carrying the flush or fsync flag are written through to the
    /// operating system (or made durable) after the latch is released,
    /// before the call returns.
    ///
    /// # Errors
    ///
    /// Returns the write error; fatal errors additionally invalidate the
    /// engine.
    pub fn append(&self, req: Append<'_>) -> EngineResult<Lsn> {
        self.check_valid()?;
        if self.config.read_only {
            return Err(EngineError::invalid_config(
                "append on a read-only environment",
            ));
        }

        let prebuilt = if req.entry_type.marshal_outside_latch() && !req.replicated {
            Some(build_frame(&req, None))
        } else {
            None
        };

        let mut state = self.write_latch.lock();
        self.check_valid()?;

        // Obsolescence is reported before the entry is sized or placed, so
        // trackers that fold it into live-size accounting see it first.
        if let Some(obsolete) = req.obsoletes {
            if let Some(tracker) = self.tracker.read().as_ref() {
                tracker.count_obsolete(obsolete, req.entry_type);
            }
        }

        let mut frame = match prebuilt {
            Some(frame) => frame,
            None => {
                let vlsn = if req.replicated {
                    let v = state.next_vlsn;
                    state.next_vlsn += 1;
                    Some(v)
                } else {
                    None
                };
                build_frame(&req, vlsn)
            }
        };

        let reservation = self
            .file_manager
            .reserve_space(frame.len() as u32, req.force_new_file);
        finalize_frame(&mut frame, reservation.prev_offset);

        if let Err(err) = self
            .buffer_pool
            .append_entry(&frame, reservation.lsn, reservation.flipped)
        {
            return Err(self.handle_write_failure(err, &mut frame, reservation.lsn, req.entry_type));
        }

        if let Some(tracker) = self.tracker.read().as_ref() {
            tracker.count_new_entry(reservation.lsn, req.entry_type, frame.len());
        }

        state.bytes_since_wakeup += frame.len() as u64;
        let interval = self.config.checkpoint_byte_interval;
        let wakeup = if interval > 0 && state.bytes_since_wakeup >= interval {
            let bytes = state.bytes_since_wakeup;
            state.bytes_since_wakeup = 0;
            Some(bytes)
        } else {
            None
        };
        drop(state);

        // The monitor runs outside the serialization point; it may append
        // (a checkpoint-start record, say) without deadlocking.
        if let Some(bytes) = wakeup {
            let monitor = self.checkpoint_monitor.read().as_ref().map(Arc::clone);
            if let Some(monitor) = monitor {
                monitor.wakeup(bytes);
            }
        }

        if req.fsync {
            self.flush_and_sync()?;
        } else if req.flush {
            self.flush()?;
        }

        Ok(reservation.lsn)
    }

    fn handle_write_failure(
        &self,
        err: EngineError,
        frame: &mut [u8],
        lsn: Lsn,
        entry_type: LogEntryType,
    ) -> EngineError {
        if entry_type == LogEntryType::TxnCommit {
            // The commit keeps its reserved space; its bytes on disk must
            // spell an abort instead. The direct write leaves the current
            // buffer behind the cursor, so it is realigned afterwards.
            warn!(%lsn, "commit write failed, neutralizing to abort");
            let neutralized = rewrite_commit_as_abort(frame, lsn).is_ok()
                && self
                    .file_manager
                    .write_bytes(lsn.file_num(), lsn.offset(), frame)
                    .is_ok()
                && self
                    .buffer_pool
                    .realign(self.file_manager.next_available_lsn())
                    .is_ok();
            if !neutralized {
                let fatal = EngineError::ChannelClosed {
                    message: format!("could not neutralize half-written commit at {lsn}"),
                };
                self.invalidate(&fatal);
                return fatal;
            }
        } else {
            self.file_manager.restore_position();
        }
        if err.is_fatal() {
            self.invalidate(&err);
        }
        err
    }

    /// Reads the entry at `lsn`.
    ///
    /// Served from the buffer pool when the entry is recent enough to still
    /// be in memory; otherwise faulted in from disk, usually in a single
    /// positioned read.
    ///
    /// # Errors
    ///
    /// Returns corruption, checksum, or I/O errors; fatal ones invalidate
    /// the engine.
    pub fn read(&self, lsn: Lsn) -> EngineResult<ScannedEntry> {
        self.check_valid()?;
        if lsn.is_null() {
            return Err(EngineError::corrupt(lsn, "read at the null LSN"));
        }
        let result = match self.buffer_pool.copy_entry_at(lsn) {
            Some(bytes) => parse_entry_from(&bytes, lsn, self.config.verify_checksums),
            None => read_entry_at(
                &self.file_manager,
                lsn,
                self.config.read_chunk_size,
                self.config.verify_checksums,
            ),
        };
        result.map_err(|err| self.note_fatal(err))
    }

    /// Reads like [`LogManager::read`] but expects that the entry may be
    /// corrupt, so corruption comes back as an ordinary error without
    /// invalidating the engine.
    ///
    /// For probing reads over suspect regions (cleaner candidates,
    /// diagnostics); channel-closed conditions are still fatal.
    ///
    /// # Errors
    ///
    /// Returns corruption, checksum, or I/O errors.
    pub fn read_expecting_corruption(&self, lsn: Lsn) -> EngineResult<ScannedEntry> {
        self.check_valid()?;
        if lsn.is_null() {
            return Err(EngineError::corrupt(lsn, "read at the null LSN"));
        }
        let result = match self.buffer_pool.copy_entry_at(lsn) {
            Some(bytes) => parse_entry_from(&bytes, lsn, self.config.verify_checksums),
            None => read_entry_at(
                &self.file_manager,
                lsn,
                self.config.read_chunk_size,
                self.config.verify_checksums,
            ),
        };
        result.map_err(|err| {
            if err.is_corruption() {
                err
            } else {
                self.note_fatal(err)
            }
        })
    }

    /// Writes all buffered bytes through to the operating system without
    /// forcing them to the platter.
    ///
    /// # Errors
    ///
    /// Returns the write error; fatal errors invalidate the engine.
    pub fn flush(&self) -> EngineResult<()> {
        self.check_valid()?;
        self.buffer_pool.flush().map_err(|err| self.note_fatal(err))
    }

    /// Makes everything appended so far durable.
    ///
    /// Syncs are group-committed: concurrent callers share one fsync. A
    /// caller whose target LSN was already covered by an in-flight sync
    /// returns without issuing its own.
    ///
    /// # Errors
    ///
    /// A failed fsync invalidates the engine: the kernel may have dropped
    /// dirty pages, so the durable prefix is no longer known.
    pub fn flush_and_sync(&self) -> EngineResult<()> {
        self.check_valid()?;
        let target = self.file_manager.last_used_lsn();
        if target.is_null() {
            return Ok(());
        }

        let mut state = self.sync_state.lock();
        loop {
            if state.last_synced.is_some_and(|synced| synced >= target) {
                return Ok(());
            }
            if !state.syncing {
                break;
            }
            self.sync_cond.wait(&mut state);
            self.check_valid()?;
        }
        state.syncing = true;
        drop(state);

        let result = self.do_sync();

        let mut state = self.sync_state.lock();
        state.syncing = false;
        match result {
            Ok(synced) => {
                if state.last_synced.map_or(true, |prev| prev < synced) {
                    state.last_synced = Some(synced);
                }
                drop(state);
                self.sync_cond.notify_all();
                Ok(())
            }
            Err(err) => {
                drop(state);
                self.sync_cond.notify_all();
                self.invalidate(&err);
                Err(err)
            }
        }
    }

    fn do_sync(&self) -> EngineResult<Lsn> {
        // The watermark must be read before the flush, and under the write
        // latch: an entry reserved but not yet copied into the pool would
        // otherwise be claimed as synced while its bytes are still only in
        // the caller's hands.
        let covered = {
            let _state = self.write_latch.lock();
            self.file_manager.last_used_lsn()
        };
        self.buffer_pool.flush()?;
        // Everything up to `covered` is now in OS buffers; older files were
        // already synced at their flips.
        self.file_manager.sync_file(covered.file_num())?;
        Ok(covered)
    }

    /// Returns a forward scanner over every active log file.
    ///
    /// Buffered bytes are flushed first so the scan sees all appends.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing or listing the directory fails.
    pub fn forward_reader(&self) -> EngineResult<FileReader<'_>> {
        self.check_valid()?;
        if !self.config.read_only {
            self.buffer_pool.flush()?;
        }
        let files = list_log_files(self.file_manager.device().as_ref())?;
        Ok(FileReader::forward(&self.file_manager, &self.config, files))
    }

    /// Returns a backward scanner starting at `from` (usually the last
    /// used LSN).
    ///
    /// # Errors
    ///
    /// Returns an error if flushing buffered bytes fails.
    pub fn backward_scanner(&self, from: Lsn) -> EngineResult<BackwardScanner<'_>> {
        self.check_valid()?;
        if !self.config.read_only {
            self.buffer_pool.flush()?;
        }
        Ok(BackwardScanner::new(&self.file_manager, &self.config, from))
    }

    /// Flushes and syncs, then releases the environment.
    ///
    /// # Errors
    ///
    /// Returns the sync error, if any.
    pub fn close(self) -> EngineResult<()> {
        if !self.config.read_only && !self.is_invalidated() {
            self.flush_and_sync()?;
        }
        Ok(())
    }

    /// True once a fatal error has poisoned the engine.
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.read().is_some()
    }

    fn check_valid(&self) -> EngineResult<()> {
        if let Some(message) = self.invalidated.read().as_ref() {
            return Err(EngineError::Invalidated {
                message: message.clone(),
            });
        }
        Ok(())
    }

    fn invalidate(&self, err: &EngineError) {
        let mut slot = self.invalidated.write();
        if slot.is_none() {
            error!(%err, "fatal error, invalidating log engine");
            *slot = Some(err.to_string());
        }
    }

    fn note_fatal(&self, err: EngineError) -> EngineError {
        if err.is_fatal() {
            self.invalidate(&err);
        }
        err
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("last_used_lsn", &self.last_used_lsn())
            .field("invalidated", &self.is_invalidated())
            .finish_non_exhaustive()
    }
}

/// Builds an unfinalized frame: header and item in place, checksum and
/// prev_offset as placeholders.
fn build_frame(req: &Append<'_>, vlsn: Option<u64>) -> Vec<u8> {
    let header = LogEntryHeader::new(
        req.entry_type,
        req.provisional,
        vlsn.is_some(),
        req.item.len() as u32,
    );
    let vlsn_bytes = vlsn.map(encode_vlsn);
    let vlsn_len = vlsn_bytes.as_ref().map_or(0, Vec::len);
    let mut frame = Vec::with_capacity(LOG_ENTRY_HEADER_SIZE + vlsn_len + req.item.len());
    frame.extend_from_slice(&header.encode());
    if let Some(bytes) = &vlsn_bytes {
        frame.extend_from_slice(bytes);
    }
    frame.extend_from_slice(req.item);
    frame
}
