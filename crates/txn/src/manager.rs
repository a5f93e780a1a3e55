//! Commit protocol driver
//!
//! Orchestrates the durable path for every transaction:
//!
//! ```text
//! 1. check state (Active for one-phase / prepare, Prepared for 2PC commit)
//! 2. reserve store capacity for the whole write set
//! 3. append BeginTxn + operation entries to the log
//! 4. append the decision marker and fsync   <- durability point
//! 5. apply operations to the in-memory stores
//! ```
//!
//! Crash before step 4: the transaction is not durable and replay discards
//! it. Crash after: replay completes it. Capacity exhaustion at step 2 or 3
//! rolls the transaction back with nothing applied and surfaces as
//! `RolledBack { source: PersistenceFull }`.
//!
//! The whole durable path runs under one commit lock, so commits are
//! durable in log-append order; registration on other transactions is not
//! serialized against it.

use crate::transaction::{Operation, Transaction, TransactionState};
use mqstore_core::{Error, Result, TxnId};
use mqstore_log::{entry, LogEntry, LogFile};
use mqstore_store::StoreRegistry;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Result of a two-phase prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Write set is durable; the coordinator must commit or roll back
    Ok,
    /// Nothing to write; the transaction is already complete
    ReadOnly,
}

/// Issues transactions and drives their durable protocol
pub struct TransactionManager {
    /// Next transaction id, seeded above the recovery watermark
    next_txn_id: AtomicU64,
    /// Serializes the durable commit path
    commit_lock: Mutex<()>,
}

impl TransactionManager {
    /// Manager issuing ids above `max_txn_id` (0 for a cold start)
    pub fn new(max_txn_id: u64) -> Self {
        TransactionManager {
            next_txn_id: AtomicU64::new(max_txn_id + 1),
            commit_lock: Mutex::new(()),
        }
    }

    /// Begin a new transaction
    pub fn begin(&self) -> Transaction {
        let id = TxnId::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        Transaction::new(id)
    }

    /// Commit a transaction
    ///
    /// `one_phase = true` commits an active (local) transaction directly;
    /// `one_phase = false` completes a previously prepared one. A prepared
    /// commit cannot fail for capacity: its write set is already durable and
    /// the decision marker is cap-exempt.
    pub fn commit(
        &self,
        txn: &mut Transaction,
        one_phase: bool,
        log: &LogFile,
        stores: &StoreRegistry,
    ) -> Result<()> {
        if one_phase {
            txn.require(TransactionState::Active, "Active")?;
        } else {
            txn.require(TransactionState::Prepared, "Prepared")?;
        }

        if txn.is_empty() {
            txn.set_state(TransactionState::Committed);
            return Ok(());
        }

        let _guard = self.commit_lock.lock();

        if one_phase {
            if let Err(cause) = self.write_body(txn, log, stores) {
                return Err(self.force_rollback(txn, log, cause, false));
            }
        }

        // Durability point
        if let Err(cause) = log
            .append_marker(&LogEntry::CommitTxn { txn: txn.id() })
            .and_then(|_| log.fsync())
        {
            return Err(self.force_rollback(txn, log, cause, one_phase));
        }

        for op in txn.operations() {
            apply_operation(op, stores)?;
        }
        txn.set_state(TransactionState::Committed);
        debug!(txn = %txn.id(), ops = txn.len(), "transaction committed");
        Ok(())
    }

    /// Prepare a transaction for a later coordinator decision
    ///
    /// Makes the write set and a prepare marker durable. After `Ok`, the
    /// transaction survives a crash as in-doubt and can only be resolved by
    /// commit or rollback.
    pub fn prepare(
        &self,
        txn: &mut Transaction,
        log: &LogFile,
        stores: &StoreRegistry,
    ) -> Result<PrepareOutcome> {
        txn.require(TransactionState::Active, "Active")?;
        let xid = match txn.xid() {
            Some(xid) => xid.clone(),
            None => {
                return Err(Error::TransactionState {
                    txn: txn.id(),
                    expected: "Active with a bound xid",
                    actual: "Active",
                })
            }
        };

        if txn.is_empty() {
            txn.set_state(TransactionState::Committed);
            return Ok(PrepareOutcome::ReadOnly);
        }

        let _guard = self.commit_lock.lock();

        if let Err(cause) = self.write_body(txn, log, stores) {
            return Err(self.force_rollback(txn, log, cause, false));
        }
        if let Err(cause) = log
            .append(&LogEntry::Prepared {
                txn: txn.id(),
                xid,
            })
            .and_then(|_| log.fsync())
        {
            return Err(self.force_rollback(txn, log, cause, true));
        }

        txn.set_state(TransactionState::Prepared);
        debug!(txn = %txn.id(), ops = txn.len(), "transaction prepared");
        Ok(PrepareOutcome::Ok)
    }

    /// Roll a transaction back
    ///
    /// Active: nothing is durable yet; the pending operations are dropped.
    /// Prepared: an abort marker is made durable so replay discards the
    /// write set. Terminal states fail fast.
    pub fn backout(&self, txn: &mut Transaction, log: &LogFile) -> Result<()> {
        match txn.state() {
            TransactionState::Active => {
                txn.clear_operations();
                txn.set_state(TransactionState::RolledBack);
                Ok(())
            }
            TransactionState::Prepared => {
                let _guard = self.commit_lock.lock();
                log.append_marker(&LogEntry::AbortTxn { txn: txn.id() })?;
                log.fsync()?;
                txn.clear_operations();
                txn.set_state(TransactionState::RolledBack);
                debug!(txn = %txn.id(), "prepared transaction rolled back");
                Ok(())
            }
            state => Err(Error::TransactionState {
                txn: txn.id(),
                expected: "Active or Prepared",
                actual: state.name(),
            }),
        }
    }

    /// Run `f` while holding the commit lock, keeping commits out
    ///
    /// Checkpointing uses this to snapshot the stores against a quiesced
    /// durable path.
    pub fn quiesce<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.commit_lock.lock();
        f()
    }

    /// Reserve capacity and write BeginTxn + the operation entries
    fn write_body(
        &self,
        txn: &Transaction,
        log: &LogFile,
        stores: &StoreRegistry,
    ) -> Result<()> {
        // Per-store byte reservation before the first log write, so a
        // refused transaction leaves no trace anywhere.
        let mut reserved: FxHashMap<&str, u64> = FxHashMap::default();
        for op in txn.operations() {
            *reserved.entry(op.store()).or_default() += op.reserved_bytes();
        }
        for (name, bytes) in reserved {
            stores.get(name)?.ensure_capacity(bytes)?;
        }

        log.append(&LogEntry::BeginTxn {
            txn: txn.id(),
            timestamp: entry::now(),
        })?;
        for op in txn.operations() {
            log.append(&op.to_log_entry(txn.id()))?;
        }
        Ok(())
    }

    /// Mandatory-rollback path for a failed commit or prepare
    ///
    /// `logged` says whether any entries for this transaction reached the
    /// log; if so an abort marker is written best-effort (replay discards an
    /// undecided transaction either way).
    fn force_rollback(
        &self,
        txn: &mut Transaction,
        log: &LogFile,
        cause: Error,
        logged: bool,
    ) -> Error {
        warn!(txn = %txn.id(), %cause, "transaction forced to roll back");
        if logged {
            if let Err(abort_err) = log
                .append_marker(&LogEntry::AbortTxn { txn: txn.id() })
                .and_then(|_| log.flush())
            {
                warn!(txn = %txn.id(), %abort_err, "abort marker not written");
            }
        }
        txn.clear_operations();
        txn.set_state(TransactionState::RolledBack);
        Error::RolledBack {
            txn: txn.id(),
            source: Box::new(cause),
        }
    }
}

/// Apply one committed operation to its target store
fn apply_operation(op: &Operation, stores: &StoreRegistry) -> Result<()> {
    match op {
        Operation::Put { store, tuple } => stores.get(store)?.store(tuple.clone()),
        Operation::Update { store, id, payload } => {
            let store = stores.get(store)?;
            let mut tuple = store.retrieve(*id)?;
            tuple.payload = payload.clone();
            store.store(tuple)
        }
        Operation::UpdateMeta { store, id, lock_id } => {
            let store = stores.get(store)?;
            let mut tuple = store.retrieve(*id)?;
            tuple.lock_id = *lock_id;
            store.store(tuple)
        }
        Operation::Remove { store, id } => stores.get(store)?.remove(*id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqstore_core::{RetentionPolicy, Tuple, TupleId, TupleType, Xid};
    use mqstore_log::OpenMode;
    use mqstore_store::ObjectStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(dir: &TempDir, store_cap: u64, log_cap: u64) -> (LogFile, StoreRegistry) {
        let (log, _) = LogFile::open(dir.path().join("a.log"), OpenMode::Warm, log_cap).unwrap();
        let registry = StoreRegistry::new();
        let (perm, _) = ObjectStore::open(
            "permanent",
            dir.path().join("perm.store"),
            RetentionPolicy::KeepAlways,
            store_cap,
        )
        .unwrap();
        registry.register(Arc::new(perm));
        (log, registry)
    }

    fn put(id: u64, payload: &[u8]) -> Operation {
        Operation::Put {
            store: "permanent".into(),
            tuple: Tuple::new(TupleId::new(id), TupleType::Item, payload.to_vec()),
        }
    }

    #[test]
    fn test_one_phase_commit_applies_and_logs() {
        let dir = TempDir::new().unwrap();
        let (log, stores) = setup(&dir, 1024 * 1024, 1024 * 1024);
        let manager = TransactionManager::new(0);

        let mut txn = manager.begin();
        txn.register(put(1, b"hello")).unwrap();
        manager.commit(&mut txn, true, &log, &stores).unwrap();

        assert_eq!(txn.state(), TransactionState::Committed);
        let store = stores.get("permanent").unwrap();
        assert_eq!(store.len(), 1);

        let entries = log.read_all().unwrap();
        assert!(matches!(entries[0], LogEntry::BeginTxn { .. }));
        assert!(matches!(entries[1], LogEntry::Put { .. }));
        assert!(matches!(entries[2], LogEntry::CommitTxn { .. }));
    }

    #[test]
    fn test_empty_commit_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let (log, stores) = setup(&dir, 1024, 1024);
        let manager = TransactionManager::new(0);

        let mut txn = manager.begin();
        manager.commit(&mut txn, true, &log, &stores).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert_eq!(log.size(), 0);
    }

    #[test]
    fn test_store_capacity_refusal_rolls_back_cleanly() {
        let dir = TempDir::new().unwrap();
        let (log, stores) = setup(&dir, 100, 1024 * 1024);
        let manager = TransactionManager::new(0);

        let mut txn = manager.begin();
        txn.register(put(1, &[0u8; 200])).unwrap();
        let err = manager.commit(&mut txn, true, &log, &stores).unwrap_err();

        assert!(err.is_persistence_full());
        assert_eq!(txn.state(), TransactionState::RolledBack);
        // Refused before the first log write: log untouched
        assert_eq!(log.size(), 0);
        assert!(stores.get("permanent").unwrap().is_empty());
    }

    #[test]
    fn test_log_capacity_refusal_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (log, stores) = setup(&dir, 1024 * 1024, 256);
        let manager = TransactionManager::new(0);

        // First transaction fits
        let mut txn = manager.begin();
        txn.register(put(1, &[0u8; 64])).unwrap();
        manager.commit(&mut txn, true, &log, &stores).unwrap();

        // Second does not; count must stay exactly at 1
        let mut txn = manager.begin();
        txn.register(put(2, &[0u8; 64])).unwrap();
        let err = manager.commit(&mut txn, true, &log, &stores).unwrap_err();
        assert!(err.is_persistence_full());
        assert_eq!(txn.state(), TransactionState::RolledBack);
        assert_eq!(stores.get("permanent").unwrap().len(), 1);
    }

    #[test]
    fn test_backout_active_discards() {
        let dir = TempDir::new().unwrap();
        let (log, stores) = setup(&dir, 1024, 1024);
        let manager = TransactionManager::new(0);

        let mut txn = manager.begin();
        txn.register(put(1, b"x")).unwrap();
        manager.backout(&mut txn, &log).unwrap();

        assert_eq!(txn.state(), TransactionState::RolledBack);
        assert_eq!(log.size(), 0);
        assert!(stores.get("permanent").unwrap().is_empty());
    }

    #[test]
    fn test_backout_twice_fails_fast() {
        let dir = TempDir::new().unwrap();
        let (log, _stores) = setup(&dir, 1024, 1024);
        let manager = TransactionManager::new(0);

        let mut txn = manager.begin();
        manager.backout(&mut txn, &log).unwrap();
        let err = manager.backout(&mut txn, &log).unwrap_err();
        assert!(matches!(err, Error::TransactionState { .. }));
    }

    #[test]
    fn test_prepare_then_commit() {
        let dir = TempDir::new().unwrap();
        let (log, stores) = setup(&dir, 1024 * 1024, 1024 * 1024);
        let manager = TransactionManager::new(0);

        let mut txn = manager.begin();
        txn.bind_xid(Xid::generate());
        txn.register(put(1, b"x")).unwrap();

        assert_eq!(
            manager.prepare(&mut txn, &log, &stores).unwrap(),
            PrepareOutcome::Ok
        );
        assert_eq!(txn.state(), TransactionState::Prepared);
        // Write set durable, but not yet applied
        assert!(stores.get("permanent").unwrap().is_empty());

        manager.commit(&mut txn, false, &log, &stores).unwrap();
        assert_eq!(stores.get("permanent").unwrap().len(), 1);
    }

    #[test]
    fn test_prepare_empty_is_read_only() {
        let dir = TempDir::new().unwrap();
        let (log, stores) = setup(&dir, 1024, 1024);
        let manager = TransactionManager::new(0);

        let mut txn = manager.begin();
        txn.bind_xid(Xid::generate());
        assert_eq!(
            manager.prepare(&mut txn, &log, &stores).unwrap(),
            PrepareOutcome::ReadOnly
        );
        assert_eq!(txn.state(), TransactionState::Committed);
        assert_eq!(log.size(), 0);
    }

    #[test]
    fn test_prepare_without_xid_fails_fast() {
        let dir = TempDir::new().unwrap();
        let (log, stores) = setup(&dir, 1024, 1024);
        let manager = TransactionManager::new(0);

        let mut txn = manager.begin();
        txn.register(put(1, b"x")).unwrap();
        let err = manager.prepare(&mut txn, &log, &stores).unwrap_err();
        assert!(matches!(err, Error::TransactionState { .. }));
    }

    #[test]
    fn test_prepared_backout_writes_abort_marker() {
        let dir = TempDir::new().unwrap();
        let (log, stores) = setup(&dir, 1024 * 1024, 1024 * 1024);
        let manager = TransactionManager::new(0);

        let mut txn = manager.begin();
        txn.bind_xid(Xid::generate());
        txn.register(put(1, b"x")).unwrap();
        manager.prepare(&mut txn, &log, &stores).unwrap();
        manager.backout(&mut txn, &log).unwrap();

        let entries = log.read_all().unwrap();
        assert!(matches!(entries.last(), Some(LogEntry::AbortTxn { .. })));
        assert!(stores.get("permanent").unwrap().is_empty());
    }

    #[test]
    fn test_rollback_then_retry_converges() {
        // The registration-level view of the rollback-retry invariant: the
        // same operation re-registered under a fresh transaction commits as
        // if the first attempt never happened.
        let dir = TempDir::new().unwrap();
        let (log, stores) = setup(&dir, 1024 * 1024, 1024 * 1024);
        let manager = TransactionManager::new(0);

        let mut tx1 = manager.begin();
        tx1.register(put(1, b"payload")).unwrap();
        manager.backout(&mut tx1, &log).unwrap();

        let mut tx2 = manager.begin();
        tx2.register(put(1, b"payload")).unwrap();
        manager.commit(&mut tx2, true, &log, &stores).unwrap();

        let store = stores.get("permanent").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.retrieve(TupleId::new(1)).unwrap().payload, b"payload");
    }
}
