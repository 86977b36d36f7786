//! Write-ahead log engine for an embedded transactional store.
//!
//! The log is the database: every piece of durable state lives in one
//! append-only stream of checksummed records, spread over rotating files in
//! a single environment directory. Records are addressed by [`Lsn`], a
//! packed `(file, offset)` pair that is never reused, and chained backwards
//! within each file so recovery can walk the log in either direction.
//!
//! # Example
//!
//! ```no_run
//! use denlog_core::{Append, Config, LogEntryType, LogManager};
//!
//! # fn main() -> denlog_core::EngineResult<()> {
//! let log = LogManager::open_path("./env".as_ref(), Config::new())?;
//! let lsn = log.append(Append::new(LogEntryType::Data, b"hello"))?;
//! log.flush_and_sync()?;
//! assert_eq!(log.read(lsn)?.item, b"hello");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod envdir;
pub mod error;
pub mod log;
pub mod lsn;

pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use log::entry::{LogEntryType, Provisional};
pub use log::manager::{Append, CheckpointMonitor, LogManager, UtilizationTracker};
pub use log::reader::ScannedEntry;
pub use lsn::Lsn;
