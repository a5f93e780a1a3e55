//! Error taxonomy for the object store
//!
//! One closed enum covers the whole workspace. Where the condition used to be
//! discriminated by a class hierarchy in the system this replaces, a variant
//! tag (plus [`AdmissionCode`] for the admission pair) does the same job.
//!
//! Expected, recoverable-by-caller conditions: `PersistenceFull`,
//! `UnsupportedContext`, `DuplicateContext`. Defects that must halt the
//! affected store: `RecoveryInconsistency`, `TransactionState`.

use crate::types::{StoreName, TupleId, TxnId, Xid};
use std::io;
use thiserror::Error;

/// Result type alias for mqstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error code distinguishing the two admission-time rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionCode {
    /// The context category is not in the configured supported set
    Unsupported,
    /// The same context category was presented more than once
    Duplicate,
}

/// Error types for the object store
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from file operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected in a log or store file
    #[error("data corruption: {0}")]
    Corruption(String),

    /// Entry truncated mid-write at the log tail
    ///
    /// Expected after a crash; replay stops cleanly at the last whole entry.
    #[error("incomplete entry at offset {offset}: have {have} bytes, need {needed}")]
    IncompleteEntry {
        /// File offset of the truncated entry
        offset: u64,
        /// Bytes available
        have: usize,
        /// Bytes required for a whole entry
        needed: usize,
    },

    /// A tuple the caller named is not present in the store
    #[error("tuple {id} not found in store '{store}'")]
    TupleNotFound {
        /// Store that was asked
        store: StoreName,
        /// Requested tuple id
        id: TupleId,
    },

    /// The named store is not known to this object manager
    #[error("unknown object store '{0}'")]
    UnknownStore(StoreName),

    /// A write would exceed configured capacity
    ///
    /// The owning transaction is marked for mandatory rollback; no partial
    /// write from it is observable afterwards.
    #[error("persistence full in '{store}': {requested} bytes requested, limit {limit}")]
    PersistenceFull {
        /// Store or log that refused the write
        store: StoreName,
        /// Bytes the write needed
        requested: u64,
        /// Configured maximum in bytes
        limit: u64,
    },

    /// A transaction was driven outside its legal state machine
    ///
    /// Programming error; fails fast rather than corrupting state.
    #[error("transaction {txn} is {actual}, operation requires {expected}")]
    TransactionState {
        /// Transaction involved
        txn: TxnId,
        /// State the operation requires
        expected: &'static str,
        /// State the transaction is actually in
        actual: &'static str,
    },

    /// The transaction was rolled back; `source` carries why
    ///
    /// Capacity exhaustion surfaces here with `PersistenceFull` as the
    /// source, never masked behind a generic I/O failure.
    #[error("transaction {txn} rolled back")]
    RolledBack {
        /// Transaction that was rolled back
        txn: TxnId,
        /// The condition that forced the rollback
        #[source]
        source: Box<Error>,
    },

    /// Log and store disagree about durable state at warm start
    ///
    /// Fatal to that store's startup; data is never silently dropped.
    #[error("recovery inconsistency in '{store}': {detail}")]
    RecoveryInconsistency {
        /// Store whose startup failed
        store: StoreName,
        /// What disagreed
        detail: String,
    },

    /// A unit of work presented a context category the store does not support
    #[error("unsupported work context '{category}'")]
    UnsupportedContext {
        /// Offending category name
        category: &'static str,
    },

    /// A unit of work presented the same context category twice
    #[error("duplicate work context '{category}'")]
    DuplicateContext {
        /// Duplicated category name
        category: &'static str,
    },

    /// The message store cannot serve calls in its current lifecycle state
    #[error("message store unavailable while {state}")]
    StoreUnavailable {
        /// Lifecycle state the store is in
        state: &'static str,
    },

    /// A persistable was driven outside its legal protocol
    ///
    /// Rollback-retry misuse: an update/remove before the entity was ever
    /// added, or an operation whose in-memory item is already gone.
    /// Programming error; fails fast.
    #[error("persistable misuse against store '{store}': {detail}")]
    PersistableMisuse {
        /// Store the persistable targets
        store: StoreName,
        /// What was illegal
        detail: &'static str,
    },

    /// `xa_start` was called with an xid already associated
    #[error("xid already associated: {0}")]
    DuplicateXid(Xid),

    /// A two-phase operation named an xid this manager does not hold
    #[error("unknown xid: {0}")]
    UnknownXid(Xid),
}

impl Error {
    /// Admission code for admission-time rejections, `None` otherwise
    pub fn admission_code(&self) -> Option<AdmissionCode> {
        match self {
            Error::UnsupportedContext { .. } => Some(AdmissionCode::Unsupported),
            Error::DuplicateContext { .. } => Some(AdmissionCode::Duplicate),
            _ => None,
        }
    }

    /// True when the root cause of this error is capacity exhaustion
    pub fn is_persistence_full(&self) -> bool {
        match self {
            Error::PersistenceFull { .. } => true,
            Error::RolledBack { source, .. } => source.is_persistence_full(),
            _ => false,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
