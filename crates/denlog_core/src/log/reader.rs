//! Sequential log scanning and the end-of-log probe.
//!
//! The forward reader pulls file regions into a sliding window sized by
//! `read_chunk_size`, growing it (up to `max_read_window_size`, or further
//! for a single oversized entry) when a record spills past the window edge.
//! The backward scanner follows the `prev_offset` chain inside a file and
//! hops across file boundaries through the file header's
//! last-entry-in-previous-file field.

use crate::config::Config;
use crate::envdir::list_log_files;
use crate::error::{EngineError, EngineResult};
use crate::log::checksum::checksum_of;
use crate::log::entry::{decode_vlsn, LogEntryHeader, LogEntryType, LOG_ENTRY_HEADER_SIZE};
use crate::log::file_manager::{FileHeader, FileManager, FILE_HEADER_ENTRY_SIZE};
use crate::lsn::Lsn;
use tracing::{debug, warn};

/// One fully materialized entry produced by a scan.
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    /// Where the entry lives.
    pub lsn: Lsn,
    /// Decoded fixed header.
    pub header: LogEntryHeader,
    /// Replication sequence, present when the replicated flag is set.
    pub vlsn: Option<u64>,
    /// The item bytes (header and VLSN stripped).
    pub item: Vec<u8>,
}

impl ScannedEntry {
    /// Total on-disk size of the entry's frame.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        let vlsn_len = self
            .vlsn
            .map(|v| crate::log::entry::encode_vlsn(v).len())
            .unwrap_or(0);
        self.header.entry_size(vlsn_len)
    }
}

/// Parses one entry frame from an in-memory slice starting at its header.
///
/// `buf` may extend past the entry; only the frame prefix is consumed.
/// Used for buffer-pool hits, where the pool guarantees the complete frame
/// is present.
pub(crate) fn parse_entry_from(buf: &[u8], lsn: Lsn, verify: bool) -> EngineResult<ScannedEntry> {
    let header = LogEntryHeader::decode(buf, lsn)?;
    let (vlsn, vlsn_len) = if header.replicated {
        let avail = buf.len().min(LOG_ENTRY_HEADER_SIZE + 10);
        let (value, len) = decode_vlsn(&buf[LOG_ENTRY_HEADER_SIZE..avail], lsn)?;
        (Some(value), len)
    } else {
        (None, 0)
    };
    let total = header.entry_size(vlsn_len);
    if buf.len() < total {
        return Err(EngineError::corrupt(
            lsn,
            format!("entry of {total} bytes truncated to {}", buf.len()),
        ));
    }
    if verify {
        let actual = checksum_of(&buf[4..total]);
        if actual != header.checksum {
            return Err(EngineError::ChecksumMismatch {
                lsn,
                expected: header.checksum,
                actual,
            });
        }
    }
    Ok(ScannedEntry {
        lsn,
        header,
        vlsn,
        item: buf[LOG_ENTRY_HEADER_SIZE + vlsn_len..total].to_vec(),
    })
}

/// Faults one entry in from disk at a known LSN.
///
/// Reads `read_chunk_size` bytes optimistically; an entry longer than the
/// first chunk costs exactly one more positioned read.
pub(crate) fn read_entry_at(
    file_manager: &FileManager,
    lsn: Lsn,
    read_chunk_size: usize,
    verify: bool,
) -> EngineResult<ScannedEntry> {
    let size = file_manager.file_size(lsn.file_num())?;
    let offset = u64::from(lsn.offset());
    if offset + LOG_ENTRY_HEADER_SIZE as u64 > size {
        return Err(EngineError::corrupt(
            lsn,
            "entry header past the end of the file",
        ));
    }
    let first = (size - offset).min(read_chunk_size as u64) as usize;
    let mut buf = file_manager.read_bytes(lsn.file_num(), lsn.offset(), first)?;

    let header = LogEntryHeader::decode(&buf, lsn)?;
    let vlsn_len = if header.replicated {
        let avail = buf.len().min(LOG_ENTRY_HEADER_SIZE + 10);
        decode_vlsn(&buf[LOG_ENTRY_HEADER_SIZE..avail], lsn)?.1
    } else {
        0
    };
    let total = header.entry_size(vlsn_len);
    if offset + total as u64 > size {
        return Err(EngineError::corrupt(lsn, "entry overruns the file"));
    }
    if total > buf.len() {
        let rest = file_manager.read_bytes(
            lsn.file_num(),
            lsn.offset() + buf.len() as u32,
            total - buf.len(),
        )?;
        buf.extend_from_slice(&rest);
    }
    parse_entry_from(&buf, lsn, verify)
}

struct CurrentFile {
    file_num: u32,
    size: u64,
}

/// Forward sequential scanner over a set of log files.
///
/// Gaps in the file list (cleaned files) are skipped naturally: the scanner
/// visits exactly the files it is given, in order.
pub struct FileReader<'a> {
    file_manager: &'a FileManager,
    files: Vec<u32>,
    file_idx: usize,
    current: Option<CurrentFile>,
    offset: u32,
    window: Vec<u8>,
    window_start: u32,
    read_chunk_size: usize,
    max_window_size: usize,
    verify_checksums: bool,
    repeat_reads: u64,
}

impl<'a> FileReader<'a> {
    /// Creates a scanner over `files` (sorted file numbers), starting at
    /// the beginning of the first.
    #[must_use]
    pub fn forward(file_manager: &'a FileManager, config: &Config, files: Vec<u32>) -> Self {
        Self {
            file_manager,
            files,
            file_idx: 0,
            current: None,
            offset: 0,
            window: Vec::new(),
            window_start: 0,
            read_chunk_size: config.read_chunk_size,
            max_window_size: config.max_read_window_size,
            verify_checksums: config.verify_checksums,
            repeat_reads: 0,
        }
    }

    /// Creates a single-file scanner that always verifies checksums,
    /// regardless of configuration. Used by the end-of-log probe.
    #[must_use]
    pub fn probe(file_manager: &'a FileManager, config: &Config, file_num: u32) -> Self {
        let mut reader = Self::forward(file_manager, config, vec![file_num]);
        reader.verify_checksums = true;
        reader
    }

    /// Number of window reloads caused by entries spilling past the window
    /// edge. A high count relative to entries scanned means the window is
    /// tuned too small.
    #[must_use]
    pub fn repeat_reads(&self) -> u64 {
        self.repeat_reads
    }

    /// Returns the next entry of any type, or `None` at the end of the last
    /// file.
    ///
    /// # Errors
    ///
    /// Returns corruption errors for bad framing and checksum mismatches
    /// (when verification is on), and I/O errors from the device.
    pub fn next_entry(&mut self) -> EngineResult<Option<ScannedEntry>> {
        self.next_matching(|_| true)
    }

    /// Returns the next entry whose type passes `selector`.
    ///
    /// Entries filtered out are skipped by size without materializing their
    /// item bytes; when checksum verification is on they are still read and
    /// validated.
    ///
    /// # Errors
    ///
    /// Same conditions as [`FileReader::next_entry`].
    pub fn next_matching(
        &mut self,
        selector: impl Fn(LogEntryType) -> bool,
    ) -> EngineResult<Option<ScannedEntry>> {
        loop {
            let Some(size) = self.enter_file()? else {
                return Ok(None);
            };
            if u64::from(self.offset) >= size {
                self.leave_file();
                continue;
            }
            let file_num = self.current.as_ref().map(|c| c.file_num).unwrap_or(0);
            let lsn = Lsn::new(file_num, self.offset);

            if u64::from(self.offset) + LOG_ENTRY_HEADER_SIZE as u64 > size {
                return Err(EngineError::corrupt(lsn, "partial entry header at file end"));
            }
            self.ensure(lsn, LOG_ENTRY_HEADER_SIZE, size)?;
            let header = LogEntryHeader::decode(self.slice(self.offset, LOG_ENTRY_HEADER_SIZE), lsn)?;

            let vlsn_len = if header.replicated {
                let avail =
                    (size - u64::from(self.offset) - LOG_ENTRY_HEADER_SIZE as u64).min(10) as usize;
                self.ensure(lsn, LOG_ENTRY_HEADER_SIZE + avail, size)?;
                let tail = self.slice(self.offset + LOG_ENTRY_HEADER_SIZE as u32, avail);
                decode_vlsn(tail, lsn)?.1
            } else {
                0
            };
            let total = header.entry_size(vlsn_len);
            if u64::from(self.offset) + total as u64 > size {
                return Err(EngineError::corrupt(lsn, "entry overruns the file"));
            }

            let selected = selector(header.entry_type);
            if !selected && !self.verify_checksums {
                // Skip without touching the item bytes.
                self.offset += total as u32;
                continue;
            }

            self.ensure(lsn, total, size)?;
            let frame = self.slice(self.offset, total);
            if self.verify_checksums {
                let actual = checksum_of(&frame[4..]);
                if actual != header.checksum {
                    return Err(EngineError::ChecksumMismatch {
                        lsn,
                        expected: header.checksum,
                        actual,
                    });
                }
            }
            let entry = if selected {
                Some(parse_entry_from(frame, lsn, false)?)
            } else {
                None
            };
            self.offset += total as u32;
            if let Some(entry) = entry {
                return Ok(Some(entry));
            }
        }
    }

    fn enter_file(&mut self) -> EngineResult<Option<u64>> {
        if let Some(current) = &self.current {
            return Ok(Some(current.size));
        }
        let Some(&file_num) = self.files.get(self.file_idx) else {
            return Ok(None);
        };
        let size = self.file_manager.file_size(file_num)?;
        self.current = Some(CurrentFile { file_num, size });
        self.offset = 0;
        self.window.clear();
        self.window_start = 0;
        Ok(Some(size))
    }

    fn leave_file(&mut self) {
        self.current = None;
        self.file_idx += 1;
    }

    /// Makes the window cover `[offset, offset + len)` of the current file.
    ///
    /// Grows the fetch beyond `read_chunk_size` when the record needs it; a
    /// record larger than `max_read_window_size` still gets a one-off
    /// transient fetch of its full size.
    fn ensure(&mut self, lsn: Lsn, len: usize, file_size: u64) -> EngineResult<()> {
        let offset = lsn.offset();
        let end = u64::from(offset) + len as u64;
        let have_end = u64::from(self.window_start) + self.window.len() as u64;
        if offset >= self.window_start && end <= have_end {
            return Ok(());
        }
        if !self.window.is_empty()
            && offset >= self.window_start
            && u64::from(offset) < have_end
        {
            // The record began inside the old window; the reload re-reads
            // bytes we already had.
            self.repeat_reads += 1;
        }
        let remaining = (file_size - u64::from(offset)) as usize;
        let fetch = self
            .read_chunk_size
            .max(len)
            .min(self.max_window_size.max(len))
            .min(remaining);
        self.window = self
            .file_manager
            .read_bytes(lsn.file_num(), offset, fetch)?;
        self.window_start = offset;
        Ok(())
    }

    fn slice(&self, offset: u32, len: usize) -> &[u8] {
        let start = (offset - self.window_start) as usize;
        &self.window[start..start + len]
    }
}

/// Reverse scanner following the per-file `prev_offset` chain.
///
/// Crossing into the previous file uses the current file's header, which
/// records the offset of the predecessor's last entry. The walk ends at the
/// first file's header. A cleaned-away predecessor is an error by default,
/// since the walk cannot reach the entries the chain promises; callers
/// expecting reclaimed history opt into stopping cleanly instead.
pub struct BackwardScanner<'a> {
    file_manager: &'a FileManager,
    read_chunk_size: usize,
    verify_checksums: bool,
    stop_at_cleaned: bool,
    next: Option<Lsn>,
}

impl<'a> BackwardScanner<'a> {
    /// Creates a scanner positioned on the entry at `start`.
    #[must_use]
    pub fn new(file_manager: &'a FileManager, config: &Config, start: Lsn) -> Self {
        Self {
            file_manager,
            read_chunk_size: config.read_chunk_size,
            verify_checksums: config.verify_checksums,
            stop_at_cleaned: false,
            next: if start.is_null() { None } else { Some(start) },
        }
    }

    /// Ends the walk cleanly at a cleaned-away predecessor instead of
    /// raising [`EngineError::FileCleaned`].
    #[must_use]
    pub fn stop_at_cleaned(mut self) -> Self {
        self.stop_at_cleaned = true;
        self
    }

    /// Returns the entry at the current position and steps backwards.
    ///
    /// # Errors
    ///
    /// Returns corruption or I/O errors from reading the entry, and
    /// [`EngineError::FileCleaned`] when the chain crosses into a missing
    /// file (unless [`BackwardScanner::stop_at_cleaned`] was set).
    pub fn next_back(&mut self) -> EngineResult<Option<ScannedEntry>> {
        let Some(lsn) = self.next else {
            return Ok(None);
        };
        let entry = read_entry_at(
            self.file_manager,
            lsn,
            self.read_chunk_size,
            self.verify_checksums,
        )?;

        self.next = if lsn.offset() != 0 {
            Some(Lsn::new(lsn.file_num(), entry.header.prev_offset))
        } else {
            // At the file header. Its payload names the last entry of the
            // immediate predecessor.
            let file_header = FileHeader::decode_payload(&entry.item, lsn)?;
            match lsn.file_num().checked_sub(1) {
                Some(prev) => {
                    if list_log_files(self.file_manager.device().as_ref())?.contains(&prev) {
                        Some(Lsn::new(prev, file_header.last_entry_in_prev_file as u32))
                    } else if self.stop_at_cleaned {
                        None
                    } else {
                        return Err(EngineError::FileCleaned { file_num: prev });
                    }
                }
                None => None,
            }
        };
        Ok(Some(entry))
    }
}

/// Where the log ends, as determined by [`find_end_of_log`].
#[derive(Debug, Clone)]
pub struct LogEnd {
    /// Where the next entry will be written.
    pub next_lsn: Lsn,
    /// Offset of the last valid entry in that file (0 when only the file
    /// header, or nothing, precedes it).
    pub prev_offset: u32,
    /// LSN of the last valid entry, `Lsn::NULL` on an empty log.
    pub last_used_lsn: Lsn,
    /// Active log files, sorted, after any quarantining.
    pub files: Vec<u32>,
}

/// Locates the true end of the log after an unclean shutdown.
///
/// Scans the highest-numbered file forward with checksum verification
/// forced on, handling the three abnormal shapes a last file can have:
///
/// 1. A corrupt file header: if the file holds no data past the header
///    region it is quarantined with the `.bad` suffix and the probe moves
///    to the previous file; a corrupt header ahead of real data means the
///    log cannot be trusted and is fatal.
/// 2. A file holding only its header: valid, the log ends right after it;
///    the last-used LSN steps back to the previous file's last entry.
/// 3. A torn tail (corruption partway through): the log ends at the last
///    entry that validates, and when `writable` the tail is truncated away
///    so the next append starts on clean bytes.
///
/// # Errors
///
/// Propagates I/O errors, too-new format versions, and (when not
/// `writable`) header corruption in the last file.
pub fn find_end_of_log(
    file_manager: &FileManager,
    config: &Config,
    writable: bool,
) -> EngineResult<LogEnd> {
    loop {
        let files = list_log_files(file_manager.device().as_ref())?;
        let Some(&last) = files.last() else {
            return Ok(LogEnd {
                next_lsn: Lsn::new(0, FILE_HEADER_ENTRY_SIZE as u32),
                prev_offset: 0,
                last_used_lsn: Lsn::NULL,
                files,
            });
        };

        // Opening the handle validates the file header.
        match file_manager.get_file_handle(last) {
            Ok(_) => {}
            Err(err) if err.is_corruption() && writable => {
                let name = crate::envdir::log_file_name(last);
                let size = file_manager.device().open(&name)?.size()?;
                if size > FILE_HEADER_ENTRY_SIZE as u64 {
                    // Real data sits behind the broken header; losing the
                    // file wholesale is not an option.
                    return Err(err);
                }
                warn!(file = last, %err, "last log file has a corrupt header");
                file_manager.quarantine_file(last)?;
                continue;
            }
            Err(err) => return Err(err),
        }

        let mut reader = FileReader::probe(file_manager, config, last);
        let mut last_entry: Option<(u32, usize)> = None;
        let mut header_item: Option<Vec<u8>> = None;
        let mut truncate_at: Option<u32> = None;
        loop {
            match reader.next_entry() {
                Ok(Some(entry)) => {
                    if entry.lsn.offset() == 0 {
                        header_item = Some(entry.item.clone());
                    }
                    last_entry = Some((entry.lsn.offset(), entry.frame_size()));
                }
                Ok(None) => break,
                Err(err) if err.is_corruption() => {
                    let good_end = last_entry
                        .map(|(offset, size)| offset + size as u32)
                        .unwrap_or(FILE_HEADER_ENTRY_SIZE as u32);
                    debug!(file = last, good_end, %err, "torn tail at end of log");
                    truncate_at = Some(good_end);
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        if let (Some(good_end), true) = (truncate_at, writable) {
            file_manager.truncate(last, good_end)?;
        }

        let (last_offset, last_size) = last_entry.unwrap_or((0, 0));
        let next_offset = truncate_at.unwrap_or(last_offset + last_size as u32);

        // A header-only last file owns no entries of its own; the last
        // used position is the previous file's final entry.
        let last_used_lsn = if last_offset == 0 {
            previous_file_last_entry(last, header_item.as_deref(), &files)?
                .unwrap_or(Lsn::new(last, 0))
        } else {
            Lsn::new(last, last_offset)
        };

        return Ok(LogEnd {
            next_lsn: Lsn::new(last, next_offset),
            prev_offset: last_offset,
            last_used_lsn,
            files,
        });
    }
}

fn previous_file_last_entry(
    file_num: u32,
    header_item: Option<&[u8]>,
    files: &[u32],
) -> EngineResult<Option<Lsn>> {
    let Some(item) = header_item else {
        return Ok(None);
    };
    let Some(prev) = file_num.checked_sub(1) else {
        return Ok(None);
    };
    if !files.contains(&prev) {
        return Ok(None);
    }
    let header = FileHeader::decode_payload(item, Lsn::new(file_num, 0))?;
    Ok(Some(Lsn::new(prev, header.last_entry_in_prev_file as u32)))
}
