//! The append-only log: framing, physical files, buffering, and scanning.
//!
//! Records are framed with a 14-byte header and addressed by LSN, a packed
//! `(file, offset)` pair. [`manager::LogManager`] is the single append
//! serialization point; [`file_manager::FileManager`] owns the rotating
//! files underneath it; [`buffer_pool::LogBufferPool`] keeps recent bytes
//! in memory; [`reader`] provides forward and backward scans plus the
//! end-of-log probe recovery runs at open.

pub mod buffer_pool;
pub mod checksum;
pub mod entry;
pub mod file_manager;
pub mod manager;
pub mod reader;
