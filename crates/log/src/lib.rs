//! Write-ahead log for the object store
//!
//! The log is the atomicity and recovery mechanism for every object store a
//! manager owns:
//! - [`entry`] defines the tuple-mutation and transaction-boundary records
//! - [`encoding`] frames each record with a length, type tag and CRC32
//! - [`log_file`] is the append-only file with its fsync discipline and
//!   capacity cap
//! - [`recovery`] reconstructs committed tuple state (and in-doubt prepared
//!   transactions) from log plus store snapshots at warm start

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoding;
pub mod entry;
pub mod log_file;
pub mod recovery;

pub use entry::LogEntry;
pub use log_file::{LogFile, OpenMode};
pub use recovery::{InDoubtTransaction, RecoveryOutcome};
