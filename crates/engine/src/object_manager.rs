//! The object manager
//!
//! One manager owns one log file and the stores recovered against it: the
//! permanent store (retained across restarts) and the temporary store
//! (discarded at every open). It issues transactions, drives their commit
//! protocol, carries the resource-manager side of two-phase commit, and
//! allocates tuple ids above everything recovery observed.
//!
//! Opening is recovery: load snapshots per retention policy, replay the log
//! over them, and surface prepared-undecided transactions so an external
//! coordinator can resolve them through `xa_commit` / `xa_rollback`.

use crate::admission::{AdmissionPolicy, WorkContext};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mqstore_core::{
    Error, Result, RetentionPolicy, StoreConfig, TupleId, TxnId, Xid, PERMANENT_STORE,
    TEMPORARY_STORE,
};
use mqstore_log::{entry, recovery, LogEntry, LogFile, OpenMode};
use mqstore_store::{ObjectStore, StoreRegistry};
use mqstore_txn::{PrepareOutcome, Transaction, TransactionManager, TransactionState};
use rustc_hash::FxHashSet;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A transaction the manager holds on behalf of an external coordinator
enum XaSlot {
    /// `xa_start` issued; the caller still owns the transaction
    Associated(TxnId),
    /// `xa_end` returned it; awaiting prepare or a decision
    Ended(Transaction),
}

/// Owner of one log and its recovered stores
pub struct ObjectManager {
    config: StoreConfig,
    log: LogFile,
    stores: StoreRegistry,
    transactions: TransactionManager,
    next_tuple_id: AtomicU64,
    xa: DashMap<Xid, XaSlot>,
    admission: AdmissionPolicy,
    shut_down: AtomicBool,
}

impl ObjectManager {
    /// Open the manager, recovering durable state
    ///
    /// Returns the manager and whether prior durable content was found (a
    /// warm start). `Clear` mode discards the log and every snapshot first.
    pub fn open(config: StoreConfig, mode: OpenMode) -> Result<(Self, bool)> {
        if mode == OpenMode::Clear {
            for path in [config.permanent_store_path(), config.temporary_store_path()] {
                if path.exists() {
                    fs::remove_file(&path)?;
                }
            }
        }

        let (log, log_warm) =
            LogFile::open(config.log_path(), mode, config.log_size.maximum)?;

        let (permanent, permanent_warm) = ObjectStore::open(
            PERMANENT_STORE,
            config.permanent_store_path(),
            RetentionPolicy::KeepAlways,
            config.permanent_store_size.maximum,
        )?;
        let (temporary, _) = ObjectStore::open(
            TEMPORARY_STORE,
            config.temporary_store_path(),
            RetentionPolicy::KeepUntilNextOpen,
            config.temporary_store_size.maximum,
        )?;

        let stores = StoreRegistry::new();
        let max_snapshot_id = permanent
            .max_tuple_id()
            .map(|id| id.as_u64())
            .unwrap_or(0);
        stores.register(Arc::new(permanent));
        stores.register(Arc::new(temporary));

        // The temporary store's retention discarded its contents, so
        // committed mutations replayed against it are expected losses.
        let mut cleared: FxHashSet<String> = FxHashSet::default();
        cleared.insert(TEMPORARY_STORE.to_string());

        let entries = log.read_all()?;
        let outcome = recovery::replay(&entries, &stores, &cleared)?;

        let xa = DashMap::new();
        for in_doubt in &outcome.in_doubt {
            let txn =
                Transaction::recovered(in_doubt.txn, in_doubt.xid.clone(), &in_doubt.mutations);
            xa.insert(in_doubt.xid.clone(), XaSlot::Ended(txn));
        }

        let warm = log_warm || permanent_warm;
        info!(
            warm,
            applied = outcome.applied,
            in_doubt = outcome.in_doubt.len(),
            "object manager open"
        );

        Ok((
            ObjectManager {
                config,
                log,
                stores,
                transactions: TransactionManager::new(outcome.max_txn_id),
                next_tuple_id: AtomicU64::new(
                    outcome.max_tuple_id.max(max_snapshot_id) + 1,
                ),
                xa,
                admission: AdmissionPolicy::default(),
                shut_down: AtomicBool::new(false),
            },
            warm,
        ))
    }

    /// Configuration this manager was opened with
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Replace the admission policy
    pub fn set_admission_policy(&mut self, policy: AdmissionPolicy) {
        self.admission = policy;
    }

    /// Resolve a registered store by name
    pub fn object_store(&self, name: &str) -> Result<Arc<ObjectStore>> {
        self.stores.get(name)
    }

    /// Allocate a fresh tuple id
    ///
    /// Monotone across the manager's life and seeded above everything
    /// recovery observed, so ids never collide across restarts.
    pub fn allocate_tuple_id(&self) -> TupleId {
        TupleId::new(self.next_tuple_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Begin a local transaction
    pub fn begin_transaction(&self) -> Transaction {
        self.transactions.begin()
    }

    /// Begin a local transaction for a unit of work carrying `contexts`
    ///
    /// The context set is validated before the transaction exists, so a
    /// rejected unit never gets to register an operation.
    pub fn begin_transaction_for(&self, contexts: &[WorkContext]) -> Result<Transaction> {
        self.admission.validate(contexts)?;
        Ok(self.begin_transaction())
    }

    /// Commit a local transaction in one phase
    pub fn commit(&self, txn: &mut Transaction) -> Result<()> {
        self.transactions.commit(txn, true, &self.log, &self.stores)
    }

    /// Roll a local transaction back
    pub fn backout(&self, txn: &mut Transaction) -> Result<()> {
        self.transactions.backout(txn, &self.log)
    }

    // ========================================================================
    // Resource-manager side of two-phase commit
    // ========================================================================

    /// Associate a new transaction with a coordinator xid
    ///
    /// The caller drives the returned transaction until `xa_end` hands it
    /// back. A second start under the same xid is refused.
    pub fn xa_start(&self, xid: &Xid) -> Result<Transaction> {
        match self.xa.entry(xid.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateXid(xid.clone())),
            Entry::Vacant(slot) => {
                let mut txn = self.transactions.begin();
                txn.bind_xid(xid.clone());
                debug!(xid = %xid, txn = %txn.id(), "xa association started");
                slot.insert(XaSlot::Associated(txn.id()));
                Ok(txn)
            }
        }
    }

    /// End the association, handing the transaction back to the manager
    pub fn xa_end(&self, txn: Transaction) -> Result<()> {
        let xid = match txn.xid() {
            Some(xid) => xid.clone(),
            None => {
                return Err(Error::TransactionState {
                    txn: txn.id(),
                    expected: "bound to an xid",
                    actual: txn.state().name(),
                })
            }
        };
        self.xa.insert(xid, XaSlot::Ended(txn));
        Ok(())
    }

    /// Prepare the transaction ended under `xid`
    ///
    /// `ReadOnly` means the transaction had nothing to write; it is already
    /// complete and the xid is released, so the coordinator must not issue a
    /// decision for it.
    pub fn xa_prepare(&self, xid: &Xid) -> Result<PrepareOutcome> {
        let mut txn = self.take_ended(xid)?;
        match self.transactions.prepare(&mut txn, &self.log, &self.stores) {
            Ok(PrepareOutcome::Ok) => {
                self.xa.insert(xid.clone(), XaSlot::Ended(txn));
                Ok(PrepareOutcome::Ok)
            }
            Ok(PrepareOutcome::ReadOnly) => Ok(PrepareOutcome::ReadOnly),
            Err(e) => Err(e),
        }
    }

    /// Commit the transaction ended under `xid`
    ///
    /// `one_phase` commits an unprepared transaction directly; otherwise the
    /// transaction must have been prepared (possibly before a restart).
    pub fn xa_commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        let mut txn = self.take_ended(xid)?;
        self.transactions
            .commit(&mut txn, one_phase, &self.log, &self.stores)
    }

    /// Roll the transaction ended under `xid` back
    pub fn xa_rollback(&self, xid: &Xid) -> Result<()> {
        let mut txn = self.take_ended(xid)?;
        self.transactions.backout(&mut txn, &self.log)
    }

    /// Xids of prepared transactions awaiting a coordinator decision
    ///
    /// After a warm start this is the in-doubt set recovered from the log.
    pub fn recovered_xids(&self) -> Vec<Xid> {
        self.xa
            .iter()
            .filter_map(|entry| match entry.value() {
                XaSlot::Ended(txn) if txn.state() == TransactionState::Prepared => {
                    Some(entry.key().clone())
                }
                _ => None,
            })
            .collect()
    }

    fn take_ended(&self, xid: &Xid) -> Result<Transaction> {
        match self.xa.remove(xid) {
            Some((_, XaSlot::Ended(txn))) => Ok(txn),
            Some((key, XaSlot::Associated(id))) => {
                self.xa.insert(key, XaSlot::Associated(id));
                Err(Error::TransactionState {
                    txn: id,
                    expected: "ended",
                    actual: "Active",
                })
            }
            None => Err(Error::UnknownXid(xid.clone())),
        }
    }

    // ========================================================================
    // Checkpoint and shutdown
    // ========================================================================

    /// Snapshot every store and compact the log
    ///
    /// Runs with the commit path quiesced, so the snapshots and the
    /// rewritten log describe the same moment. Entries the snapshots now
    /// capture are rewritten away and their log space reclaimed; prepared
    /// transactions still awaiting a coordinator decision live only in the
    /// log, so their entries are carried into the new file.
    pub fn checkpoint(&self) -> Result<()> {
        self.transactions.quiesce(|| {
            for store in self.stores.all() {
                store.write_snapshot()?;
            }

            // Undecided prepared transactions, from the log itself: a
            // decision racing this checkpoint is still blocked on the
            // commit lock, so its marker is not in the log yet and its
            // write set gets carried forward.
            let entries = self.log.read_all()?;
            let mut undecided: FxHashSet<TxnId> = FxHashSet::default();
            for entry in &entries {
                match entry {
                    LogEntry::Prepared { txn, .. } => {
                        undecided.insert(*txn);
                    }
                    LogEntry::CommitTxn { txn } | LogEntry::AbortTxn { txn } => {
                        undecided.remove(txn);
                    }
                    _ => {}
                }
            }

            let mut carried = vec![LogEntry::Checkpoint {
                timestamp: entry::now(),
            }];
            carried.extend(
                entries
                    .iter()
                    .filter(|e| e.txn_id().map_or(false, |txn| undecided.contains(&txn)))
                    .cloned(),
            );

            let bytes = self.log.rewrite(&carried)?;
            info!(bytes, in_doubt = undecided.len(), "checkpoint written");
            Ok(())
        })
    }

    /// Checkpoint and mark the manager closed
    ///
    /// Idempotent: the second and later calls do nothing.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.checkpoint()?;
        info!("object manager shut down");
        Ok(())
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            if let Err(e) = self.shutdown() {
                warn!(error = %e, "shutdown during drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqstore_core::{Tuple, TupleType};
    use mqstore_txn::Operation;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StoreConfig {
        StoreConfig::for_testing(dir.path())
    }

    fn put_op(manager: &ObjectManager, payload: &[u8]) -> (Operation, TupleId) {
        let id = manager.allocate_tuple_id();
        (
            Operation::Put {
                store: PERMANENT_STORE.to_string(),
                tuple: Tuple::new(id, TupleType::Item, payload.to_vec()),
            },
            id,
        )
    }

    #[test]
    fn test_cold_open_then_warm_recovery() {
        let dir = TempDir::new().unwrap();
        let id = {
            let (manager, warm) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
            assert!(!warm);

            let (op, id) = put_op(&manager, b"survives");
            let mut txn = manager.begin_transaction();
            txn.register(op).unwrap();
            manager.commit(&mut txn).unwrap();
            manager.shutdown().unwrap();
            id
        };

        let (manager, warm) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
        assert!(warm);
        let store = manager.object_store(PERMANENT_STORE).unwrap();
        assert_eq!(store.retrieve(id).unwrap().payload, b"survives");
    }

    #[test]
    fn test_recovery_without_shutdown_replays_log() {
        // Simulated crash: no shutdown, no checkpoint; the log alone must
        // reconstruct committed state.
        let dir = TempDir::new().unwrap();
        let id = {
            let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
            let (op, id) = put_op(&manager, b"logged");
            let mut txn = manager.begin_transaction();
            txn.register(op).unwrap();
            manager.commit(&mut txn).unwrap();
            // Suppress the drop-time checkpoint
            manager.shut_down.store(true, Ordering::SeqCst);
            id
        };

        let (manager, warm) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
        assert!(warm);
        let store = manager.object_store(PERMANENT_STORE).unwrap();
        assert_eq!(store.retrieve(id).unwrap().payload, b"logged");
    }

    #[test]
    fn test_clear_mode_discards_everything() {
        let dir = TempDir::new().unwrap();
        {
            let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
            let (op, _) = put_op(&manager, b"doomed");
            let mut txn = manager.begin_transaction();
            txn.register(op).unwrap();
            manager.commit(&mut txn).unwrap();
            manager.shutdown().unwrap();
        }

        let (manager, warm) = ObjectManager::open(config(&dir), OpenMode::Clear).unwrap();
        assert!(!warm);
        assert!(manager.object_store(PERMANENT_STORE).unwrap().is_empty());
    }

    #[test]
    fn test_tuple_ids_stay_unique_across_restart() {
        let dir = TempDir::new().unwrap();
        let first = {
            let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
            let (op, id) = put_op(&manager, b"x");
            let mut txn = manager.begin_transaction();
            txn.register(op).unwrap();
            manager.commit(&mut txn).unwrap();
            manager.shutdown().unwrap();
            id
        };

        let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
        assert!(manager.allocate_tuple_id() > first);
    }

    #[test]
    fn test_unknown_store_lookup() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
        assert!(matches!(
            manager.object_store("nowhere"),
            Err(Error::UnknownStore(_))
        ));
    }

    #[test]
    fn test_duplicate_xid_refused() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();

        let xid = Xid::generate();
        let _txn = manager.xa_start(&xid).unwrap();
        assert!(matches!(
            manager.xa_start(&xid),
            Err(Error::DuplicateXid(_))
        ));
    }

    #[test]
    fn test_two_phase_round_trip() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();

        let xid = Xid::generate();
        let mut txn = manager.xa_start(&xid).unwrap();
        let (op, id) = put_op(&manager, b"2pc");
        txn.register(op).unwrap();
        manager.xa_end(txn).unwrap();

        assert_eq!(manager.xa_prepare(&xid).unwrap(), PrepareOutcome::Ok);
        // Prepared but undecided: not applied
        let store = manager.object_store(PERMANENT_STORE).unwrap();
        assert!(store.is_empty());

        manager.xa_commit(&xid, false).unwrap();
        assert_eq!(store.retrieve(id).unwrap().payload, b"2pc");
        // Decision consumed the xid
        assert!(matches!(
            manager.xa_commit(&xid, false),
            Err(Error::UnknownXid(_))
        ));
    }

    #[test]
    fn test_read_only_prepare_releases_xid() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();

        let xid = Xid::generate();
        let txn = manager.xa_start(&xid).unwrap();
        manager.xa_end(txn).unwrap();

        assert_eq!(manager.xa_prepare(&xid).unwrap(), PrepareOutcome::ReadOnly);
        assert!(matches!(
            manager.xa_commit(&xid, false),
            Err(Error::UnknownXid(_))
        ));
    }

    #[test]
    fn test_in_doubt_transaction_survives_restart() {
        let dir = TempDir::new().unwrap();
        let xid = Xid::generate();
        let id = {
            let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
            let mut txn = manager.xa_start(&xid).unwrap();
            let (op, id) = put_op(&manager, b"in doubt");
            txn.register(op).unwrap();
            manager.xa_end(txn).unwrap();
            manager.xa_prepare(&xid).unwrap();
            // Crash before the decision
            manager.shut_down.store(true, Ordering::SeqCst);
            id
        };

        let (manager, warm) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
        assert!(warm);
        assert_eq!(manager.recovered_xids(), vec![xid.clone()]);
        // Still not applied until the coordinator decides
        let store = manager.object_store(PERMANENT_STORE).unwrap();
        assert!(store.is_empty());

        manager.xa_commit(&xid, false).unwrap();
        assert_eq!(store.retrieve(id).unwrap().payload, b"in doubt");
    }

    #[test]
    fn test_in_doubt_rollback_after_restart() {
        let dir = TempDir::new().unwrap();
        let xid = Xid::generate();
        {
            let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
            let mut txn = manager.xa_start(&xid).unwrap();
            let (op, _) = put_op(&manager, b"discarded");
            txn.register(op).unwrap();
            manager.xa_end(txn).unwrap();
            manager.xa_prepare(&xid).unwrap();
            manager.shut_down.store(true, Ordering::SeqCst);
        }

        let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
        manager.xa_rollback(&xid).unwrap();
        assert!(manager.object_store(PERMANENT_STORE).unwrap().is_empty());

        // And the rollback sticks across another restart
        manager.shutdown().unwrap();
        drop(manager);
        let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
        assert!(manager.recovered_xids().is_empty());
        assert!(manager.object_store(PERMANENT_STORE).unwrap().is_empty());
    }

    #[test]
    fn test_prepare_while_still_associated_fails_fast() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();

        let xid = Xid::generate();
        let _txn = manager.xa_start(&xid).unwrap();
        assert!(matches!(
            manager.xa_prepare(&xid),
            Err(Error::TransactionState { .. })
        ));
    }

    #[test]
    fn test_admission_screens_before_transaction() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();

        assert!(manager
            .begin_transaction_for(&[WorkContext::security()])
            .is_ok());
        let err = manager
            .begin_transaction_for(&[WorkContext::security(), WorkContext::security_run_as()])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateContext { .. }));
    }

    #[test]
    fn test_shutdown_idempotent() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
        manager.shutdown().unwrap();
        manager.shutdown().unwrap();
    }

    #[test]
    fn test_checkpoint_reclaims_log_space() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir).with_log_maximum(1024);
        {
            let (manager, _) = ObjectManager::open(config.clone(), OpenMode::Warm).unwrap();

            // Commit until the log cap refuses a transaction
            let mut committed = Vec::new();
            loop {
                let (op, id) = put_op(&manager, b"payload");
                let mut txn = manager.begin_transaction();
                txn.register(op).unwrap();
                match manager.commit(&mut txn) {
                    Ok(()) => committed.push(id),
                    Err(e) => {
                        assert!(e.is_persistence_full());
                        break;
                    }
                }
                assert!(committed.len() < 100, "log cap never enforced");
            }

            // The cap bounds the working set, not lifetime writes: after a
            // checkpoint the reclaimed space accepts new transactions.
            manager.checkpoint().unwrap();
            let (op, id) = put_op(&manager, b"payload");
            let mut txn = manager.begin_transaction();
            txn.register(op).unwrap();
            manager.commit(&mut txn).unwrap();
            committed.push(id);
            manager.shutdown().unwrap();

            let store = manager.object_store(PERMANENT_STORE).unwrap();
            assert_eq!(store.len(), committed.len());
        }

        // A clean restart starts from the compacted log, not the full one
        let (manager, warm) = ObjectManager::open(config, OpenMode::Warm).unwrap();
        assert!(warm);
        let (op, _) = put_op(&manager, b"payload");
        let mut txn = manager.begin_transaction();
        txn.register(op).unwrap();
        manager.commit(&mut txn).unwrap();
    }

    #[test]
    fn test_checkpoint_carries_prepared_transactions() {
        let dir = TempDir::new().unwrap();
        let xid = Xid::generate();
        let id = {
            let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
            let mut txn = manager.xa_start(&xid).unwrap();
            let (op, id) = put_op(&manager, b"carried");
            txn.register(op).unwrap();
            manager.xa_end(txn).unwrap();
            manager.xa_prepare(&xid).unwrap();

            // The compaction must not drop the undecided write set
            manager.checkpoint().unwrap();
            manager.shut_down.store(true, Ordering::SeqCst);
            id
        };

        let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
        assert_eq!(manager.recovered_xids(), vec![xid.clone()]);
        manager.xa_commit(&xid, false).unwrap();
        let store = manager.object_store(PERMANENT_STORE).unwrap();
        assert_eq!(store.retrieve(id).unwrap().payload, b"carried");
    }

    #[test]
    fn test_checkpoint_bounds_replay() {
        let dir = TempDir::new().unwrap();
        {
            let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
            let (op, _) = put_op(&manager, b"before");
            let mut txn = manager.begin_transaction();
            txn.register(op).unwrap();
            manager.commit(&mut txn).unwrap();
            manager.checkpoint().unwrap();

            let (op, _) = put_op(&manager, b"after");
            let mut txn = manager.begin_transaction();
            txn.register(op).unwrap();
            manager.commit(&mut txn).unwrap();
            manager.shut_down.store(true, Ordering::SeqCst);
        }

        let (manager, _) = ObjectManager::open(config(&dir), OpenMode::Warm).unwrap();
        // Snapshot carries the first, replay adds only the second
        assert_eq!(manager.object_store(PERMANENT_STORE).unwrap().len(), 2);
    }
}
