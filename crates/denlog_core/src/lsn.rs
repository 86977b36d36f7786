//! Log sequence numbers.

use std::fmt;

/// Address of a record in the log.
///
/// An LSN packs a `(file_number, file_offset)` pair into one 64-bit value:
/// the file number in the high 32 bits, the byte offset within that file in
/// the low 32 bits. LSNs are totally ordered by `(file_number, offset)`,
/// which the packing preserves, and are immutable once assigned - a given
/// LSN is never reused, even after the file it names is cleaned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(u64);

impl Lsn {
    /// Reserved sentinel meaning "no LSN".
    pub const NULL: Lsn = Lsn(u64::MAX);

    /// Creates an LSN from a file number and an offset within that file.
    #[must_use]
    pub const fn new(file_num: u32, offset: u32) -> Self {
        Self(((file_num as u64) << 32) | offset as u64)
    }

    /// Reconstructs an LSN from its packed representation.
    #[must_use]
    pub const fn from_packed(packed: u64) -> Self {
        Self(packed)
    }

    /// Returns the packed 64-bit representation.
    #[must_use]
    pub const fn as_packed(self) -> u64 {
        self.0
    }

    /// Returns the file number this LSN addresses.
    #[must_use]
    pub const fn file_num(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the byte offset within the file.
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    /// Returns true if this is the NULL sentinel.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "lsn:NULL")
        } else {
            write!(f, "lsn:{:#x}/{:#x}", self.file_num(), self.offset())
        }
    }
}
