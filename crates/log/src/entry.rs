//! Log entry types
//!
//! Every tuple mutation is logged under its owning transaction; a
//! transaction becomes durable only once its `CommitTxn` marker is on disk.
//! `Prepared` is the two-phase decision point: once it is durable, the
//! transaction must be resolvable by commit or rollback even across a crash.

use mqstore_core::{LockId, StoreName, Tuple, TupleId, TxnId, Xid};
use serde::{Deserialize, Serialize};

/// Milliseconds since the epoch, recorded on transaction begin
pub type Timestamp = i64;

/// Current time for log entries
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// One record in the write-ahead log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    /// Start of a transaction's entries
    BeginTxn {
        /// Owning transaction
        txn: TxnId,
        /// When the transaction's commit/prepare was logged
        timestamp: Timestamp,
    },

    /// Add a tuple to a store (first persistence of an entity)
    Put {
        /// Owning transaction
        txn: TxnId,
        /// Target store
        store: StoreName,
        /// The full tuple image
        tuple: Tuple,
    },

    /// Rewrite a tuple's payload, leaving its metadata alone
    Update {
        /// Owning transaction
        txn: TxnId,
        /// Target store
        store: StoreName,
        /// Tuple being rewritten
        id: TupleId,
        /// New payload bytes
        payload: Vec<u8>,
    },

    /// Rewrite a tuple's lock stamp only, leaving the payload alone
    UpdateMeta {
        /// Owning transaction
        txn: TxnId,
        /// Target store
        store: StoreName,
        /// Tuple being stamped
        id: TupleId,
        /// New lock stamp
        lock_id: LockId,
    },

    /// Remove a tuple from a store
    Remove {
        /// Owning transaction
        txn: TxnId,
        /// Target store
        store: StoreName,
        /// Tuple being removed
        id: TupleId,
    },

    /// Two-phase prepare decision point
    ///
    /// Durable once fsynced; a prepared transaction survives restart as
    /// in-doubt until the coordinator resolves it.
    Prepared {
        /// Owning transaction
        txn: TxnId,
        /// Coordinator-supplied id the outcome is keyed by
        xid: Xid,
    },

    /// Transaction committed; all its entries are now durable state
    CommitTxn {
        /// Committed transaction
        txn: TxnId,
    },

    /// Transaction rolled back; all its entries are discarded
    AbortTxn {
        /// Rolled-back transaction
        txn: TxnId,
    },

    /// Store snapshots were written; replay may start here
    Checkpoint {
        /// When the snapshots were written
        timestamp: Timestamp,
    },
}

impl LogEntry {
    /// Owning transaction id, for all entries except `Checkpoint`
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            LogEntry::BeginTxn { txn, .. }
            | LogEntry::Put { txn, .. }
            | LogEntry::Update { txn, .. }
            | LogEntry::UpdateMeta { txn, .. }
            | LogEntry::Remove { txn, .. }
            | LogEntry::Prepared { txn, .. }
            | LogEntry::CommitTxn { txn }
            | LogEntry::AbortTxn { txn } => Some(*txn),
            LogEntry::Checkpoint { .. } => None,
        }
    }

    /// True for transaction boundary markers
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            LogEntry::BeginTxn { .. } | LogEntry::CommitTxn { .. } | LogEntry::AbortTxn { .. }
        )
    }

    /// True for tuple mutations (`Put`/`Update`/`UpdateMeta`/`Remove`)
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            LogEntry::Put { .. }
                | LogEntry::Update { .. }
                | LogEntry::UpdateMeta { .. }
                | LogEntry::Remove { .. }
        )
    }

    /// Target store name for mutations
    pub fn store(&self) -> Option<&str> {
        match self {
            LogEntry::Put { store, .. }
            | LogEntry::Update { store, .. }
            | LogEntry::UpdateMeta { store, .. }
            | LogEntry::Remove { store, .. } => Some(store),
            _ => None,
        }
    }
}
