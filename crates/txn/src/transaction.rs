//! Transaction state machine and pending operations
//!
//! States: `Active → (Prepared) → Committed` or `RolledBack`; a local
//! backout goes `Active → RolledBack` directly. Registration against a
//! terminal transaction fails fast.

use mqstore_core::{Error, LockId, Result, StoreName, Tuple, TupleId, TxnId, Xid};
use mqstore_log::LogEntry;
use rustc_hash::FxHashSet;

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting operation registrations
    Active,
    /// Write set durable with a prepare marker; awaiting the decision
    Prepared,
    /// Terminal: all operations applied
    Committed,
    /// Terminal: all operations discarded
    RolledBack,
}

impl TransactionState {
    /// Name for error reporting
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::Active => "Active",
            TransactionState::Prepared => "Prepared",
            TransactionState::Committed => "Committed",
            TransactionState::RolledBack => "RolledBack",
        }
    }

    /// True for `Committed` and `RolledBack`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack
        )
    }
}

/// One pending tuple-level change
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Add a tuple (first persistence, or a retried add)
    Put {
        /// Target store
        store: StoreName,
        /// Full tuple image
        tuple: Tuple,
    },
    /// Rewrite a tuple's payload
    Update {
        /// Target store
        store: StoreName,
        /// Tuple being rewritten
        id: TupleId,
        /// New payload
        payload: Vec<u8>,
    },
    /// Rewrite a tuple's lock stamp only
    UpdateMeta {
        /// Target store
        store: StoreName,
        /// Tuple being stamped
        id: TupleId,
        /// New lock stamp
        lock_id: LockId,
    },
    /// Remove a tuple
    Remove {
        /// Target store
        store: StoreName,
        /// Tuple being removed
        id: TupleId,
    },
}

impl Operation {
    /// Target store name
    pub fn store(&self) -> &str {
        match self {
            Operation::Put { store, .. }
            | Operation::Update { store, .. }
            | Operation::UpdateMeta { store, .. }
            | Operation::Remove { store, .. } => store,
        }
    }

    /// Tuple this operation touches
    pub fn tuple_id(&self) -> TupleId {
        match self {
            Operation::Put { tuple, .. } => tuple.id,
            Operation::Update { id, .. }
            | Operation::UpdateMeta { id, .. }
            | Operation::Remove { id, .. } => *id,
        }
    }

    /// Bytes this operation can add to its store, for admission accounting
    ///
    /// Conservative: updates count their whole new payload, removes free
    /// nothing until applied.
    pub fn reserved_bytes(&self) -> u64 {
        match self {
            Operation::Put { tuple, .. } => tuple.stored_size(),
            Operation::Update { payload, .. } => payload.len() as u64,
            Operation::UpdateMeta { .. } | Operation::Remove { .. } => 0,
        }
    }

    /// The log entry recording this operation under `txn`
    pub fn to_log_entry(&self, txn: TxnId) -> LogEntry {
        match self {
            Operation::Put { store, tuple } => LogEntry::Put {
                txn,
                store: store.clone(),
                tuple: tuple.clone(),
            },
            Operation::Update { store, id, payload } => LogEntry::Update {
                txn,
                store: store.clone(),
                id: *id,
                payload: payload.clone(),
            },
            Operation::UpdateMeta { store, id, lock_id } => LogEntry::UpdateMeta {
                txn,
                store: store.clone(),
                id: *id,
                lock_id: *lock_id,
            },
            Operation::Remove { store, id } => LogEntry::Remove {
                txn,
                store: store.clone(),
                id: *id,
            },
        }
    }

    /// Rebuild an operation from its recovered log entry
    pub fn from_log_entry(entry: &LogEntry) -> Option<Operation> {
        match entry {
            LogEntry::Put { store, tuple, .. } => Some(Operation::Put {
                store: store.clone(),
                tuple: tuple.clone(),
            }),
            LogEntry::Update {
                store, id, payload, ..
            } => Some(Operation::Update {
                store: store.clone(),
                id: *id,
                payload: payload.clone(),
            }),
            LogEntry::UpdateMeta {
                store, id, lock_id, ..
            } => Some(Operation::UpdateMeta {
                store: store.clone(),
                id: *id,
                lock_id: *lock_id,
            }),
            LogEntry::Remove { store, id, .. } => Some(Operation::Remove {
                store: store.clone(),
                id: *id,
            }),
            _ => None,
        }
    }
}

/// The unit of atomicity callers drive
///
/// Owned exclusively by the caller that created it (or, between `xa_end`
/// and resolution, by the object manager) until it reaches a terminal
/// state. Never shared between logical units of work.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    state: TransactionState,
    operations: Vec<Operation>,
    touched: FxHashSet<TupleId>,
    xid: Option<Xid>,
}

impl Transaction {
    /// New active transaction
    pub fn new(id: TxnId) -> Self {
        Transaction {
            id,
            state: TransactionState::Active,
            operations: Vec::new(),
            touched: FxHashSet::default(),
            xid: None,
        }
    }

    /// Rebuild a prepared transaction recovered from the log
    ///
    /// Its entries (including the prepare marker) are already durable; only
    /// the decision is outstanding.
    pub fn recovered(id: TxnId, xid: Xid, mutations: &[LogEntry]) -> Self {
        let operations: Vec<Operation> = mutations
            .iter()
            .filter_map(Operation::from_log_entry)
            .collect();
        let touched = operations.iter().map(|op| op.tuple_id()).collect();
        Transaction {
            id,
            state: TransactionState::Prepared,
            operations,
            touched,
            xid: Some(xid),
        }
    }

    /// Transaction id
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Coordinator xid, when two-phase
    pub fn xid(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    /// Bind this transaction to a coordinator xid
    pub fn bind_xid(&mut self, xid: Xid) {
        self.xid = Some(xid);
    }

    /// Pending operations in registration order
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Number of pending operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True when nothing has been registered
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// True when this transaction enlisted the given tuple
    pub fn touched(&self, id: TupleId) -> bool {
        self.touched.contains(&id)
    }

    /// Register a pending operation
    ///
    /// Fails fast with `TransactionState` unless the transaction is active.
    pub fn register(&mut self, op: Operation) -> Result<()> {
        self.require(TransactionState::Active, "Active")?;
        self.touched.insert(op.tuple_id());
        self.operations.push(op);
        Ok(())
    }

    /// Check the transaction is in `expected` state
    pub fn require(&self, expected: TransactionState, name: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(Error::TransactionState {
                txn: self.id,
                expected: name,
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    pub(crate) fn clear_operations(&mut self) {
        self.operations.clear();
        self.touched.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqstore_core::TupleType;

    fn put(id: u64) -> Operation {
        Operation::Put {
            store: "permanent".into(),
            tuple: Tuple::new(TupleId::new(id), TupleType::Item, b"x".to_vec()),
        }
    }

    #[test]
    fn test_register_tracks_touched_tuples() {
        let mut txn = Transaction::new(TxnId::new(1));
        txn.register(put(10)).unwrap();
        txn.register(Operation::Remove {
            store: "permanent".into(),
            id: TupleId::new(11),
        })
        .unwrap();

        assert_eq!(txn.len(), 2);
        assert!(txn.touched(TupleId::new(10)));
        assert!(txn.touched(TupleId::new(11)));
        assert!(!txn.touched(TupleId::new(12)));
    }

    #[test]
    fn test_register_after_terminal_fails_fast() {
        let mut txn = Transaction::new(TxnId::new(1));
        txn.set_state(TransactionState::RolledBack);

        let err = txn.register(put(1)).unwrap_err();
        assert!(matches!(
            err,
            Error::TransactionState {
                actual: "RolledBack",
                ..
            }
        ));
    }

    #[test]
    fn test_operation_log_entry_roundtrip() {
        let txn = TxnId::new(3);
        let ops = vec![
            put(1),
            Operation::Update {
                store: "permanent".into(),
                id: TupleId::new(1),
                payload: b"v2".to_vec(),
            },
            Operation::UpdateMeta {
                store: "permanent".into(),
                id: TupleId::new(1),
                lock_id: LockId::new(4),
            },
            Operation::Remove {
                store: "permanent".into(),
                id: TupleId::new(1),
            },
        ];

        for op in ops {
            let entry = op.to_log_entry(txn);
            assert_eq!(entry.txn_id(), Some(txn));
            assert_eq!(Operation::from_log_entry(&entry), Some(op));
        }
    }

    #[test]
    fn test_recovered_transaction_is_prepared() {
        let txn_id = TxnId::new(5);
        let xid = Xid::generate();
        let mutations = vec![put(7).to_log_entry(txn_id)];

        let txn = Transaction::recovered(txn_id, xid.clone(), &mutations);
        assert_eq!(txn.state(), TransactionState::Prepared);
        assert_eq!(txn.xid(), Some(&xid));
        assert_eq!(txn.len(), 1);
        assert!(txn.touched(TupleId::new(7)));
    }

    #[test]
    fn test_reserved_bytes() {
        assert_eq!(put(1).reserved_bytes(), 33); // 1-byte payload + overhead
        assert_eq!(
            Operation::Remove {
                store: "permanent".into(),
                id: TupleId::new(1)
            }
            .reserved_bytes(),
            0
        );
    }
}
