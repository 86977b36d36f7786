//! Rolling checksum accumulator shared by the writer and every reader.

use crate::error::{EngineError, EngineResult};
use crate::lsn::Lsn;

/// Computes the checksum of a contiguous byte run in one call.
#[must_use]
pub fn checksum_of(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// A rolling checksum accumulator.
///
/// The writer feeds it header-minus-checksum plus item bytes while
/// marshalling; readers feed it the same ranges as they arrive, possibly in
/// several chunks when a record spans read-buffer boundaries.
#[derive(Debug, Default)]
pub struct ChecksumValidator {
    hasher: crc32fast::Hasher,
}

impl ChecksumValidator {
    /// Creates a fresh accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the running checksum.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Consumes the accumulator and returns the checksum value.
    #[must_use]
    pub fn value(self) -> u32 {
        self.hasher.finalize()
    }

    /// Consumes the accumulator and compares against the stored checksum.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ChecksumMismatch`] on disagreement.
    pub fn validate(self, expected: u32, lsn: Lsn) -> EngineResult<()> {
        let actual = self.hasher.finalize();
        if actual != expected {
            return Err(EngineError::ChecksumMismatch {
                lsn,
                expected,
                actual,
            });
        }
        Ok(())
    }
}
