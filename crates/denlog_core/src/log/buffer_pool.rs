//! Pooled in-memory log buffers.
//!
//! A fixed set of buffers is allocated up front. The newest buffer receives
//! appends; older ones keep their bytes around so reads of recently written
//! entries are served from memory instead of disk. Buffers are recycled
//! FIFO: when the current buffer fills, the oldest is reset and becomes the
//! new current.

use crate::config::Config;
use crate::error::EngineResult;
use crate::log::file_manager::FileManager;
use crate::lsn::Lsn;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// One pooled buffer: a byte run mapped to a contiguous region of a single
/// log file.
///
/// Every entry lands wholly inside one buffer (appends that don't fit
/// trigger a switch first), so a hit at some LSN always yields the complete
/// frame.
pub struct LogBuffer {
    latch: RwLock<BufferState>,
}

struct BufferState {
    data: Vec<u8>,
    capacity: usize,
    /// LSN of the first entry held, `Lsn::NULL` while empty.
    first_lsn: Lsn,
    last_lsn: Lsn,
    /// File the buffer maps to; meaningful only when non-empty.
    file_num: u32,
    /// File offset of `data[0]`.
    start_offset: u32,
    /// Bytes already written through to the file.
    flushed_len: usize,
}

impl BufferState {
    fn reset(&mut self, lsn: Lsn) {
        self.data.clear();
        self.first_lsn = Lsn::NULL;
        self.last_lsn = Lsn::NULL;
        self.file_num = lsn.file_num();
        self.start_offset = lsn.offset();
        self.flushed_len = 0;
    }

    fn is_empty(&self) -> bool {
        self.first_lsn.is_null()
    }

    fn has_room(&self, len: usize) -> bool {
        self.data.len() + len <= self.capacity
    }

    fn contains(&self, lsn: Lsn) -> bool {
        !self.is_empty()
            && lsn.file_num() == self.file_num
            && lsn.offset() >= self.start_offset
            && u64::from(lsn.offset()) < u64::from(self.start_offset) + self.data.len() as u64
    }
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            latch: RwLock::new(BufferState {
                data: Vec::with_capacity(capacity),
                capacity,
                first_lsn: Lsn::NULL,
                last_lsn: Lsn::NULL,
                file_num: 0,
                start_offset: 0,
                flushed_len: 0,
            }),
        }
    }

    /// Copies the bytes from `lsn` to the end of the buffer's used region,
    /// or `None` if the buffer doesn't hold that LSN.
    fn copy_from(&self, lsn: Lsn) -> Option<Vec<u8>> {
        let state = self.latch.read();
        if !state.contains(lsn) {
            return None;
        }
        let start = (lsn.offset() - state.start_offset) as usize;
        Some(state.data[start..].to_vec())
    }
}

/// The pool of log buffers.
///
/// All append-side methods must be called under the log-write serialization
/// point; only [`LogBufferPool::copy_entry_at`] is called concurrently by
/// readers.
pub struct LogBufferPool {
    file_manager: Arc<FileManager>,
    /// Back of the deque is the current (append) buffer.
    buffers: Mutex<VecDeque<Arc<LogBuffer>>>,
    buffer_size: usize,
}

impl LogBufferPool {
    /// Allocates the pool. `config.num_log_buffers` buffers of
    /// `config.log_buffer_size` bytes each.
    #[must_use]
    pub fn new(file_manager: Arc<FileManager>, config: &Config) -> Self {
        let mut buffers = VecDeque::with_capacity(config.num_log_buffers);
        for _ in 0..config.num_log_buffers {
            buffers.push_back(Arc::new(LogBuffer::new(config.log_buffer_size)));
        }
        Self {
            file_manager,
            buffers: Mutex::new(buffers),
            buffer_size: config.log_buffer_size,
        }
    }

    /// Appends one finalized entry frame at its reserved position.
    ///
    /// When `flipped` is set the previous file is finished: the current
    /// buffer is flushed, the finished file fsynced and its handle closed,
    /// and appends move to a fresh buffer in the new file. Frames larger
    /// than a whole buffer bypass the pool and go straight to the file.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing displaced bytes or a direct write
    /// fails.
    pub fn append_entry(&self, frame: &[u8], lsn: Lsn, flipped: bool) -> EngineResult<()> {
        if flipped {
            self.flush()?;
            let finished = lsn.file_num().wrapping_sub(1);
            self.file_manager.sync_and_close(finished)?;
            self.switch_current(lsn);
        }

        if frame.len() > self.buffer_size {
            // Oversized entry: flush what precedes it, then write the frame
            // through a transient allocation directly to the file.
            self.flush()?;
            trace!(%lsn, len = frame.len(), "oversized entry bypasses buffer pool");
            self.file_manager
                .write_bytes(lsn.file_num(), lsn.offset(), frame)?;
            // The current buffer's region now ends before the direct write;
            // restart it past the frame so the next pooled append stays
            // contiguous with the cursor.
            let end = Lsn::new(lsn.file_num(), lsn.offset() + frame.len() as u32);
            self.current().latch.write().reset(end);
            return Ok(());
        }

        let current = self.current();
        {
            let mut state = current.latch.write();
            if state.is_empty() {
                state.reset(lsn);
            } else if !state.has_room(frame.len()) {
                drop(state);
                self.flush()?;
                self.switch_current(lsn);
                let current = self.current();
                let mut state = current.latch.write();
                state.reset(lsn);
                state.data.extend_from_slice(frame);
                state.first_lsn = lsn;
                state.last_lsn = lsn;
                return Ok(());
            }
            if state.first_lsn.is_null() {
                state.first_lsn = lsn;
            }
            state.data.extend_from_slice(frame);
            state.last_lsn = lsn;
        }
        Ok(())
    }

    /// Writes the current buffer's unflushed bytes through to its file.
    ///
    /// Tracks a flush watermark so repeated calls only write the delta.
    /// Does not fsync.
    ///
    /// # Errors
    ///
    /// Returns an error if the positioned write fails.
    pub fn flush(&self) -> EngineResult<()> {
        let current = self.current();
        let mut state = current.latch.write();
        if state.is_empty() || state.flushed_len == state.data.len() {
            return Ok(());
        }
        let from = state.flushed_len;
        let offset = state.start_offset + from as u32;
        let file_num = state.file_num;
        self.file_manager
            .write_bytes(file_num, offset, &state.data[from..])?;
        state.flushed_len = state.data.len();
        Ok(())
    }

    /// Flushes and empties the current buffer so the next append starts a
    /// fresh region at `next_lsn`.
    ///
    /// Called after an entry's bytes were written to the file outside the
    /// pool while its reservation stands, which breaks the current buffer's
    /// contiguity with the cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing the buffered bytes fails.
    pub fn realign(&self, next_lsn: Lsn) -> EngineResult<()> {
        self.flush()?;
        self.current().latch.write().reset(next_lsn);
        Ok(())
    }

    /// Serves a read from the pool: returns the bytes from `lsn` to the end
    /// of whichever buffer holds it, or `None` on a miss.
    ///
    /// The returned slice always contains the complete frame of the entry
    /// at `lsn`.
    #[must_use]
    pub fn copy_entry_at(&self, lsn: Lsn) -> Option<Vec<u8>> {
        let buffers: Vec<Arc<LogBuffer>> = self.buffers.lock().iter().cloned().collect();
        // Newest first; recent entries are the common case.
        for buffer in buffers.iter().rev() {
            if let Some(bytes) = buffer.copy_from(lsn) {
                return Some(bytes);
            }
        }
        None
    }

    /// Recycles the oldest buffer as the new current, positioned at `lsn`.
    ///
    /// The pool latch is released before the buffer latch is taken. Only
    /// the appender (under the write serialization point) switches buffers,
    /// so the buffer is never absent from the pool for a concurrent switch.
    fn switch_current(&self, lsn: Lsn) {
        let oldest = self.buffers.lock().pop_front().expect("pool is never empty");
        oldest.latch.write().reset(lsn);
        self.buffers.lock().push_back(oldest);
    }

    fn current(&self) -> Arc<LogBuffer> {
        Arc::clone(self.buffers.lock().back().expect("pool is never empty"))
    }
}

impl std::fmt::Debug for LogBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBufferPool")
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}
