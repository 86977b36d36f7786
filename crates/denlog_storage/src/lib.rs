//! # DenLog Storage
//!
//! Positioned-I/O device layer for the DenLog write-ahead log engine.
//!
//! This crate provides the lowest-level storage abstraction for DenLog.
//! Channels are **opaque byte containers** - they do not interpret the
//! data they store.
//!
//! ## Design Principles
//!
//! - Channels expose positioned reads and writes (the log engine patches
//!   record headers in place and writes buffers at reserved offsets)
//! - No knowledge of DenLog file formats, entry framing, or LSNs
//! - Must be `Send + Sync` for concurrent access
//! - DenLog owns all file format interpretation
//!
//! ## Available Devices
//!
//! - [`MemDevice`] - For testing, with fault injection and I/O counters
//! - [`FsDevice`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use denlog_storage::{Device, MemDevice};
//!
//! let device = MemDevice::new();
//! let channel = device.open("00000000.jdb").unwrap();
//! channel.write_at(0, b"hello world").unwrap();
//! let data = channel.read_at(0, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod error;
mod fs;
mod mem;

pub use channel::{Device, FileChannel};
pub use error::{StorageError, StorageResult};
pub use fs::{FsChannel, FsDevice};
pub use mem::{DeviceStats, MemChannel, MemDevice};
