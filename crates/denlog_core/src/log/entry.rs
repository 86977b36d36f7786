//! Log entry types and binary framing.
//!
//! Every record in the log is framed as:
//!
//! ```text
//! | checksum (4) | type (1) | version+flags (1) | prev_offset (4) | item_size (4) | [vlsn] | item |
//! ```
//!
//! The checksum covers everything after its own field, including the
//! optional variable-length replication sequence (VLSN) and the item bytes,
//! and is computed last, after every other field is in place. `prev_offset`
//! is the offset of the previous entry in the same file, forming a backward
//! linked chain that reverse scans follow without any separate index.

use crate::error::{EngineError, EngineResult};
use crate::log::checksum::checksum_of;
use crate::lsn::Lsn;

/// Size of the invariant entry header prefix.
pub const LOG_ENTRY_HEADER_SIZE: usize = 14;

/// Current entry format version. Stored in the low bits of the
/// version+flags byte.
pub const LOG_FORMAT_VERSION: u8 = 2;

/// Provisional "always" flag bit.
const FLAG_PROVISIONAL_ALWAYS: u8 = 0x80;
/// Provisional "before checkpoint end" flag bit.
const FLAG_PROVISIONAL_BEFORE_CKPT_END: u8 = 0x40;
/// Replicated flag bit; when set, a VLSN follows the fixed header.
const FLAG_REPLICATED: u8 = 0x20;
/// All filtering-metadata bits, cleared before the version is used for
/// type dispatch.
const FLAG_MASK: u8 = 0xE0;

/// The closed set of entry kinds.
///
/// Entry types are process-wide and immutable; they are looked up by
/// `(type_num, version)` and each declares its dispatch properties in the
/// static tables below. The type number ceiling leaves room for future
/// kinds without widening the byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogEntryType {
    /// First record of every log file.
    FileHeader = 1,
    /// Non-transactional leaf record supplied by the node layer.
    Data = 2,
    /// Transactional leaf record.
    TxnData = 3,
    /// Internal node image.
    Node = 4,
    /// Tree root change.
    Root = 5,
    /// Transaction begin marker.
    TxnBegin = 6,
    /// Transaction commit marker.
    TxnCommit = 7,
    /// Transaction abort marker.
    TxnAbort = 8,
    /// Two-phase-commit prepare marker.
    TxnPrepare = 9,
    /// Checkpoint start marker.
    CheckpointStart = 10,
    /// Checkpoint end marker.
    CheckpointEnd = 11,
    /// Per-file utilization summary.
    FileSummary = 12,
    /// Record migrated forward by the cleaner.
    Migrate = 13,
    /// Diagnostic trace message.
    Trace = 14,
}

/// Highest assigned type number; anything above it is corruption.
pub const MAX_TYPE_NUM: u8 = 14;

impl LogEntryType {
    /// Converts a type number to an entry type.
    pub fn from_type_num(num: u8) -> Option<Self> {
        match num {
            1 => Some(Self::FileHeader),
            2 => Some(Self::Data),
            3 => Some(Self::TxnData),
            4 => Some(Self::Node),
            5 => Some(Self::Root),
            6 => Some(Self::TxnBegin),
            7 => Some(Self::TxnCommit),
            8 => Some(Self::TxnAbort),
            9 => Some(Self::TxnPrepare),
            10 => Some(Self::CheckpointStart),
            11 => Some(Self::CheckpointEnd),
            12 => Some(Self::FileSummary),
            13 => Some(Self::Migrate),
            14 => Some(Self::Trace),
            _ => None,
        }
    }

    /// Returns the type number.
    #[must_use]
    pub const fn type_num(self) -> u8 {
        self as u8
    }

    /// Looks up an entry type by `(type_num, version)`.
    ///
    /// # Errors
    ///
    /// An out-of-range type number is a corruption error; it is raised
    /// before any checksum work because it is the cheaper and more
    /// informative check. A too-new version is an unsupported-format error.
    pub fn lookup(type_num: u8, version: u8, lsn: Lsn) -> EngineResult<Self> {
        let entry_type = Self::from_type_num(type_num).ok_or_else(|| {
            EngineError::corrupt(lsn, format!("invalid entry type number {type_num}"))
        })?;
        if version > LOG_FORMAT_VERSION {
            return Err(EngineError::UnsupportedVersion {
                found: version,
                supported: LOG_FORMAT_VERSION,
            });
        }
        Ok(entry_type)
    }

    /// True if entries of this type belong to a transaction.
    #[must_use]
    pub const fn is_transactional(self) -> bool {
        matches!(
            self,
            Self::TxnData
                | Self::TxnBegin
                | Self::TxnCommit
                | Self::TxnAbort
                | Self::TxnPrepare
        )
    }

    /// True if entries of this type may appear in the replication stream.
    #[must_use]
    pub const fn is_replicable(self) -> bool {
        matches!(
            self,
            Self::Data | Self::TxnData | Self::TxnBegin | Self::TxnCommit | Self::TxnAbort
        )
    }

    /// True if entries of this type may be marshalled before entering the
    /// log-write serialization point.
    ///
    /// Types whose on-disk size depends on state assigned under the latch
    /// (commit sequences, utilization side effects, VLSNs) must marshal
    /// inside it.
    #[must_use]
    pub const fn marshal_outside_latch(self) -> bool {
        matches!(
            self,
            Self::FileHeader
                | Self::Data
                | Self::TxnData
                | Self::Node
                | Self::TxnBegin
                | Self::CheckpointStart
                | Self::Migrate
                | Self::Trace
        )
    }
}

/// Recovery-filtering policy for an entry.
///
/// Provisional entries are written to the log but skipped when rebuilding
/// in-memory structures during recovery, keeping multi-record operations
/// atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisional {
    /// Not provisional.
    No,
    /// Skipped by recovery unconditionally.
    Always,
    /// Skipped by recovery only when the entry precedes the recovery
    /// checkpoint's start.
    BeforeCkptEnd,
}

impl Provisional {
    fn flag_bits(self) -> u8 {
        match self {
            Self::No => 0,
            Self::Always => FLAG_PROVISIONAL_ALWAYS,
            Self::BeforeCkptEnd => FLAG_PROVISIONAL_BEFORE_CKPT_END,
        }
    }

    fn from_flag_bits(bits: u8) -> Self {
        if bits & FLAG_PROVISIONAL_ALWAYS != 0 {
            Self::Always
        } else if bits & FLAG_PROVISIONAL_BEFORE_CKPT_END != 0 {
            Self::BeforeCkptEnd
        } else {
            Self::No
        }
    }

    /// Decides whether recovery should skip the entry at `entry_lsn`.
    ///
    /// `ckpt_start_lsn` is the LSN of the recovery checkpoint's start
    /// record. The `BeforeCkptEnd` variant interacts with retroactive
    /// obsolete counting; the checkpoint LSN is taken explicitly so the
    /// policy stays at the recovery call site instead of being baked in
    /// here.
    #[must_use]
    pub fn is_skipped(self, entry_lsn: Lsn, ckpt_start_lsn: Lsn) -> bool {
        match self {
            Self::No => false,
            Self::Always => true,
            Self::BeforeCkptEnd => !ckpt_start_lsn.is_null() && entry_lsn < ckpt_start_lsn,
        }
    }
}

/// Decoded entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntryHeader {
    /// Stored checksum over everything after the checksum field.
    pub checksum: u32,
    /// The entry kind.
    pub entry_type: LogEntryType,
    /// Format version (flag bits already cleared).
    pub version: u8,
    /// Provisional recovery-filtering policy.
    pub provisional: Provisional,
    /// Whether a VLSN follows the fixed header.
    pub replicated: bool,
    /// Offset of the previous entry in the same file.
    pub prev_offset: u32,
    /// Size of the item bytes (excluding header and VLSN).
    pub item_size: u32,
}

impl LogEntryHeader {
    /// Creates a header for a new entry. Checksum and prev_offset start as
    /// placeholders and are stamped by [`finalize_frame`].
    #[must_use]
    pub fn new(
        entry_type: LogEntryType,
        provisional: Provisional,
        replicated: bool,
        item_size: u32,
    ) -> Self {
        Self {
            checksum: 0,
            entry_type,
            version: LOG_FORMAT_VERSION,
            provisional,
            replicated,
            prev_offset: 0,
            item_size,
        }
    }

    /// Encodes the 14-byte header prefix.
    #[must_use]
    pub fn encode(&self) -> [u8; LOG_ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; LOG_ENTRY_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4] = self.entry_type.type_num();
        let mut vf = self.version & !FLAG_MASK;
        vf |= self.provisional.flag_bits();
        if self.replicated {
            vf |= FLAG_REPLICATED;
        }
        buf[5] = vf;
        buf[6..10].copy_from_slice(&self.prev_offset.to_le_bytes());
        buf[10..14].copy_from_slice(&self.item_size.to_le_bytes());
        buf
    }

    /// Decodes a header from the first 14 bytes of `buf`.
    ///
    /// Validation order is cheapest-first: type number range, then version.
    /// Checksum verification happens separately, once the item bytes are
    /// available.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for a bad type number or a truncated
    /// buffer, and an unsupported-version error for a too-new version.
    pub fn decode(buf: &[u8], lsn: Lsn) -> EngineResult<Self> {
        if buf.len() < LOG_ENTRY_HEADER_SIZE {
            return Err(EngineError::corrupt(
                lsn,
                format!("truncated entry header: {} bytes", buf.len()),
            ));
        }
        let checksum = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let type_num = buf[4];
        let vf = buf[5];
        // Provisional and replicated bits are filtering metadata, not part
        // of format identity.
        let version = vf & !FLAG_MASK;
        let entry_type = LogEntryType::lookup(type_num, version, lsn)?;
        Ok(Self {
            checksum,
            entry_type,
            version,
            provisional: Provisional::from_flag_bits(vf & FLAG_MASK),
            replicated: vf & FLAG_REPLICATED != 0,
            prev_offset: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            item_size: u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
        })
    }

    /// Total on-disk size of the entry this header describes, given the
    /// already-decoded VLSN width.
    #[must_use]
    pub fn entry_size(&self, vlsn_len: usize) -> usize {
        LOG_ENTRY_HEADER_SIZE + vlsn_len + self.item_size as usize
    }
}

/// Encodes a VLSN as a LEB128 varint, returning the encoded bytes.
#[must_use]
pub fn encode_vlsn(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Decodes a LEB128 VLSN from the start of `buf`.
///
/// Returns the value and the number of bytes consumed.
///
/// # Errors
///
/// Returns a corruption error on truncation or overlong encoding.
pub fn decode_vlsn(buf: &[u8], lsn: Lsn) -> EngineResult<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 10 {
            break;
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(EngineError::corrupt(lsn, "truncated or overlong VLSN"))
}

/// Stamps `prev_offset` into a fully marshalled frame and computes the
/// checksum last, over everything after the checksum field.
pub fn finalize_frame(frame: &mut [u8], prev_offset: u32) {
    debug_assert!(frame.len() >= LOG_ENTRY_HEADER_SIZE);
    frame[6..10].copy_from_slice(&prev_offset.to_le_bytes());
    let crc = checksum_of(&frame[4..]);
    frame[0..4].copy_from_slice(&crc.to_le_bytes());
}

/// Rewrites a marshalled commit frame in place as an abort frame.
///
/// The entry keeps its size; only the type byte changes and the checksum is
/// recomputed over the unchanged remainder. This is used exactly once: when
/// a write to disk fails partway and previously flushed bytes may already
/// spell a commit that a later recovery must not honor.
///
/// # Errors
///
/// Returns a corruption error if the frame is not a commit entry.
pub fn rewrite_commit_as_abort(frame: &mut [u8], lsn: Lsn) -> EngineResult<()> {
    if frame.len() < LOG_ENTRY_HEADER_SIZE {
        return Err(EngineError::corrupt(lsn, "frame too short to neutralize"));
    }
    if frame[4] != LogEntryType::TxnCommit.type_num() {
        return Err(EngineError::corrupt(
            lsn,
            format!("cannot neutralize non-commit entry type {}", frame[4]),
        ));
    }
    frame[4] = LogEntryType::TxnAbort.type_num();
    let crc = checksum_of(&frame[4..]);
    frame[0..4].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_TYPES: [LogEntryType; 14] = [
        LogEntryType::FileHeader,
        LogEntryType::Data,
        LogEntryType::TxnData,
        LogEntryType::Node,
        LogEntryType::Root,
        LogEntryType::TxnBegin,
        LogEntryType::TxnCommit,
        LogEntryType::TxnAbort,
        LogEntryType::TxnPrepare,
        LogEntryType::CheckpointStart,
        LogEntryType::CheckpointEnd,
        LogEntryType::FileSummary,
        LogEntryType::Migrate,
        LogEntryType::Trace,
    ];

    #[test]
    fn type_num_roundtrip() {
        for t in ALL_TYPES {
            assert_eq!(LogEntryType::from_type_num(t.type_num()), Some(t));
        }
        assert_eq!(LogEntryType::from_type_num(0), None);
        assert_eq!(LogEntryType::from_type_num(MAX_TYPE_NUM + 1), None);
    }

    #[test]
    fn bad_type_num_is_corruption_not_version_error() {
        let err = LogEntryType::lookup(99, 0, Lsn::new(0, 38)).unwrap_err();
        assert!(matches!(err, EngineError::Corrupt { .. }));
    }

    #[test]
    fn future_version_is_rejected() {
        let err =
            LogEntryType::lookup(2, LOG_FORMAT_VERSION + 1, Lsn::new(0, 38)).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedVersion { .. }));
    }

    #[test]
    fn header_roundtrip_with_flags() {
        let mut header = LogEntryHeader::new(
            LogEntryType::TxnCommit,
            Provisional::BeforeCkptEnd,
            true,
            123,
        );
        header.prev_offset = 4567;
        header.checksum = 0xDEAD_BEEF;

        let bytes = header.encode();
        let decoded = LogEntryHeader::decode(&bytes, Lsn::new(1, 0)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn flag_bits_do_not_leak_into_version() {
        let header =
            LogEntryHeader::new(LogEntryType::Data, Provisional::Always, true, 10);
        let bytes = header.encode();
        let decoded = LogEntryHeader::decode(&bytes, Lsn::new(0, 38)).unwrap();
        assert_eq!(decoded.version, LOG_FORMAT_VERSION);
        assert_eq!(decoded.provisional, Provisional::Always);
        assert!(decoded.replicated);
    }

    #[test]
    fn provisional_skip_policy() {
        let ckpt = Lsn::new(2, 100);
        let before = Lsn::new(1, 500);
        let after = Lsn::new(2, 500);

        assert!(!Provisional::No.is_skipped(before, ckpt));
        assert!(Provisional::Always.is_skipped(after, ckpt));
        assert!(Provisional::BeforeCkptEnd.is_skipped(before, ckpt));
        assert!(!Provisional::BeforeCkptEnd.is_skipped(after, ckpt));
        // No checkpoint in the log: nothing precedes it.
        assert!(!Provisional::BeforeCkptEnd.is_skipped(before, Lsn::NULL));
    }

    #[test]
    fn finalize_then_verify() {
        let header = LogEntryHeader::new(LogEntryType::Data, Provisional::No, false, 4);
        let mut frame = Vec::new();
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(b"item");

        finalize_frame(&mut frame, 38);

        let decoded = LogEntryHeader::decode(&frame, Lsn::new(0, 52)).unwrap();
        assert_eq!(decoded.prev_offset, 38);
        assert_eq!(decoded.checksum, checksum_of(&frame[4..]));
    }

    #[test]
    fn commit_rewrites_to_abort_with_valid_checksum() {
        let header =
            LogEntryHeader::new(LogEntryType::TxnCommit, Provisional::No, false, 3);
        let mut frame = Vec::new();
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(b"txn");
        finalize_frame(&mut frame, 0);

        rewrite_commit_as_abort(&mut frame, Lsn::new(0, 38)).unwrap();

        let decoded = LogEntryHeader::decode(&frame, Lsn::new(0, 38)).unwrap();
        assert_eq!(decoded.entry_type, LogEntryType::TxnAbort);
        assert_eq!(decoded.checksum, checksum_of(&frame[4..]));
        assert_eq!(&frame[LOG_ENTRY_HEADER_SIZE..], b"txn");
    }

    #[test]
    fn rewrite_rejects_non_commit() {
        let header = LogEntryHeader::new(LogEntryType::Data, Provisional::No, false, 0);
        let mut frame = header.encode().to_vec();
        finalize_frame(&mut frame, 0);
        assert!(rewrite_commit_as_abort(&mut frame, Lsn::new(0, 38)).is_err());
    }

    #[test]
    fn vlsn_roundtrip_edges() {
        for v in [0u64, 1, 127, 128, 16383, 16384, u64::MAX] {
            let encoded = encode_vlsn(v);
            let (decoded, len) = decode_vlsn(&encoded, Lsn::NULL).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(len, encoded.len());
        }
    }

    #[test]
    fn vlsn_truncated_is_corrupt() {
        let encoded = encode_vlsn(u64::MAX);
        assert!(decode_vlsn(&encoded[..encoded.len() - 1], Lsn::NULL).is_err());
    }

    proptest! {
        #[test]
        fn header_roundtrip_prop(
            type_idx in 0usize..ALL_TYPES.len(),
            prov_idx in 0u8..3,
            replicated in any::<bool>(),
            prev_offset in any::<u32>(),
            item_size in any::<u32>(),
        ) {
            let provisional = match prov_idx {
                0 => Provisional::No,
                1 => Provisional::Always,
                _ => Provisional::BeforeCkptEnd,
            };
            let mut header = LogEntryHeader::new(
                ALL_TYPES[type_idx], provisional, replicated, item_size);
            header.prev_offset = prev_offset;

            let decoded =
                LogEntryHeader::decode(&header.encode(), Lsn::new(0, 38)).unwrap();
            prop_assert_eq!(decoded, header);
        }

        #[test]
        fn vlsn_roundtrip_prop(value in any::<u64>()) {
            let encoded = encode_vlsn(value);
            let (decoded, len) = decode_vlsn(&encoded, Lsn::NULL).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(len, encoded.len());
        }
    }
}
