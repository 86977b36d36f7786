//! Log engine configuration.

use crate::error::{EngineError, EngineResult};

/// Configuration for opening a log environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the environment directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Maximum size of a single log file before rotation.
    ///
    /// A file may exceed this by at most the single entry that triggered
    /// rotation.
    pub max_file_size: u32,

    /// Capacity of each pooled log buffer.
    pub log_buffer_size: usize,

    /// Number of buffers in the pool.
    pub num_log_buffers: usize,

    /// Target size of the open-file-handle cache.
    ///
    /// The cache may temporarily exceed this when every cached handle is
    /// busy.
    pub file_cache_size: usize,

    /// Bytes fetched by a single positioned read when faulting in an entry
    /// from disk.
    pub read_chunk_size: usize,

    /// Ceiling for the sequential reader's sliding window.
    pub max_read_window_size: usize,

    /// Whether readers verify checksums.
    ///
    /// On by default; turning it off is only sensible for dump tooling over
    /// known-good logs.
    pub verify_checksums: bool,

    /// Wake the checkpointer after this many bytes have been appended
    /// (0 = never).
    pub checkpoint_byte_interval: u64,

    /// Whether to open the environment read-only (shared reader lock).
    pub read_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            max_file_size: 10 * 1024 * 1024, // 10 MB
            log_buffer_size: 1024 * 1024,    // 1 MB
            num_log_buffers: 3,
            file_cache_size: 100,
            read_chunk_size: 2048,
            max_read_window_size: 16 * 1024 * 1024,
            verify_checksums: true,
            checkpoint_byte_interval: 20 * 1024 * 1024,
            read_only: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the environment if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the maximum log file size.
    #[must_use]
    pub const fn max_file_size(mut self, size: u32) -> Self {
        self.max_file_size = size;
        self
    }

    /// Sets the pooled buffer capacity.
    #[must_use]
    pub const fn log_buffer_size(mut self, size: usize) -> Self {
        self.log_buffer_size = size;
        self
    }

    /// Sets the number of pooled buffers.
    #[must_use]
    pub const fn num_log_buffers(mut self, count: usize) -> Self {
        self.num_log_buffers = count;
        self
    }

    /// Sets the file handle cache target size.
    #[must_use]
    pub const fn file_cache_size(mut self, size: usize) -> Self {
        self.file_cache_size = size;
        self
    }

    /// Sets the fault-in read chunk size.
    #[must_use]
    pub const fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Sets whether readers verify checksums.
    #[must_use]
    pub const fn verify_checksums(mut self, value: bool) -> Self {
        self.verify_checksums = value;
        self
    }

    /// Sets the checkpointer wakeup interval in bytes.
    #[must_use]
    pub const fn checkpoint_byte_interval(mut self, bytes: u64) -> Self {
        self.checkpoint_byte_interval = bytes;
        self
    }

    /// Opens the environment read-only.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Validates parameter combinations.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] for impossible tunings. These
    /// are reported once at startup and never retried.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_file_size < 1024 {
            return Err(EngineError::invalid_config(
                "max_file_size must be at least 1 KiB",
            ));
        }
        if self.num_log_buffers < 2 {
            return Err(EngineError::invalid_config(
                "num_log_buffers must be at least 2 (one current, one flushing)",
            ));
        }
        if self.log_buffer_size == 0 {
            return Err(EngineError::invalid_config(
                "log_buffer_size must be non-zero",
            ));
        }
        if self.file_cache_size == 0 {
            return Err(EngineError::invalid_config(
                "file_cache_size must be non-zero",
            ));
        }
        if self.read_chunk_size < crate::log::entry::LOG_ENTRY_HEADER_SIZE {
            return Err(EngineError::invalid_config(
                "read_chunk_size smaller than an entry header",
            ));
        }
        if self.max_read_window_size < self.read_chunk_size {
            return Err(EngineError::invalid_config(
                "max_read_window_size smaller than read_chunk_size",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .max_file_size(1 << 20)
            .num_log_buffers(5)
            .verify_checksums(false);

        assert_eq!(config.max_file_size, 1 << 20);
        assert_eq!(config.num_log_buffers, 5);
        assert!(!config.verify_checksums);
    }

    #[test]
    fn rejects_single_buffer_pool() {
        let config = Config::new().num_log_buffers(1);
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn rejects_tiny_files() {
        let config = Config::new().max_file_size(100);
        assert!(config.validate().is_err());
    }
}
