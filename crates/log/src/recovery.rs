//! Warm-start replay
//!
//! Reconstructs committed tuple state from the log and the store snapshots:
//!
//! 1. Store snapshots carry everything up to the last `Checkpoint` entry.
//! 2. Transactions whose `CommitTxn` lies after that checkpoint are applied
//!    here, in commit order.
//! 3. Transactions with a durable `Prepared` marker but no decision are
//!    surfaced as in-doubt; the coordinator resolves them after reopen.
//! 4. Everything else (no commit marker) is discarded.
//!
//! A committed mutation the target store cannot honor is a
//! `RecoveryInconsistency` and fails that store's startup, except against a
//! store whose retention cleared it at open (opportunistically-persisted
//! items are allowed to vanish with it).

use crate::entry::LogEntry;
use mqstore_core::{Error, Result, StoreName, TxnId, Xid};
use mqstore_store::StoreRegistry;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{info, warn};

/// A transaction left prepared but undecided at crash time
#[derive(Debug, Clone)]
pub struct InDoubtTransaction {
    /// Local transaction id
    pub txn: TxnId,
    /// Coordinator id its outcome is keyed by
    pub xid: Xid,
    /// The mutations that will apply if the coordinator commits
    pub mutations: Vec<LogEntry>,
}

/// What replay found and did
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    /// Transactions applied from the log (committed after the checkpoint)
    pub applied: usize,
    /// Transactions discarded (aborted or never decided, not prepared)
    pub discarded: usize,
    /// Prepared-undecided transactions awaiting coordinator resolution
    pub in_doubt: Vec<InDoubtTransaction>,
    /// Highest transaction id seen anywhere in the log
    pub max_txn_id: u64,
    /// Highest tuple id seen anywhere in the log
    pub max_tuple_id: u64,
}

#[derive(Default)]
struct TxnRecord {
    mutations: Vec<LogEntry>,
    prepared: Option<Xid>,
    committed_at: Option<usize>,
    aborted: bool,
}

/// Replay `entries` against the registered stores
///
/// `cleared` names stores whose retention discarded prior contents at open;
/// committed mutations against them are skipped rather than cross-checked.
pub fn replay(
    entries: &[LogEntry],
    registry: &StoreRegistry,
    cleared: &FxHashSet<StoreName>,
) -> Result<RecoveryOutcome> {
    let mut outcome = RecoveryOutcome::default();

    let last_checkpoint = entries
        .iter()
        .rposition(|e| matches!(e, LogEntry::Checkpoint { .. }));

    let mut records: FxHashMap<TxnId, TxnRecord> = FxHashMap::default();
    let mut commit_order: Vec<(usize, TxnId)> = Vec::new();

    for (position, entry) in entries.iter().enumerate() {
        if let Some(txn) = entry.txn_id() {
            outcome.max_txn_id = outcome.max_txn_id.max(txn.as_u64());
        }
        if let LogEntry::Put { tuple, .. } = entry {
            outcome.max_tuple_id = outcome.max_tuple_id.max(tuple.id.as_u64());
        }

        match entry {
            LogEntry::BeginTxn { txn, .. } => {
                records.entry(*txn).or_default();
            }
            LogEntry::Put { txn, .. }
            | LogEntry::Update { txn, .. }
            | LogEntry::UpdateMeta { txn, .. }
            | LogEntry::Remove { txn, .. } => {
                records.entry(*txn).or_default().mutations.push(entry.clone());
            }
            LogEntry::Prepared { txn, xid } => {
                records.entry(*txn).or_default().prepared = Some(xid.clone());
            }
            LogEntry::CommitTxn { txn } => {
                records.entry(*txn).or_default().committed_at = Some(position);
                commit_order.push((position, *txn));
            }
            LogEntry::AbortTxn { txn } => {
                records.entry(*txn).or_default().aborted = true;
            }
            LogEntry::Checkpoint { .. } => {}
        }
    }

    // Apply committed transactions in commit order, but only those whose
    // decision lies after the checkpoint the snapshots were taken at.
    let apply_from = last_checkpoint.unwrap_or(0);
    for (position, txn) in &commit_order {
        if last_checkpoint.is_some() && *position < apply_from {
            continue;
        }
        if let Some(record) = records.get(txn) {
            for mutation in &record.mutations {
                apply_mutation(mutation, registry, cleared)?;
            }
            outcome.applied += 1;
        }
    }

    // Classify what never committed
    for (txn, record) in records.iter() {
        if record.committed_at.is_some() {
            continue;
        }
        if record.aborted {
            outcome.discarded += 1;
        } else if let Some(xid) = &record.prepared {
            outcome.in_doubt.push(InDoubtTransaction {
                txn: *txn,
                xid: xid.clone(),
                mutations: record.mutations.clone(),
            });
        } else if !record.mutations.is_empty() {
            // Mutations without any decision marker: torn commit, discard
            outcome.discarded += 1;
        }
    }

    if !outcome.in_doubt.is_empty() {
        warn!(
            count = outcome.in_doubt.len(),
            "in-doubt transactions recovered; awaiting coordinator resolution"
        );
    }
    info!(
        applied = outcome.applied,
        discarded = outcome.discarded,
        in_doubt = outcome.in_doubt.len(),
        "log replay complete"
    );

    Ok(outcome)
}

/// Apply one committed mutation to its target store
pub fn apply_mutation(
    mutation: &LogEntry,
    registry: &StoreRegistry,
    cleared: &FxHashSet<StoreName>,
) -> Result<()> {
    let store_name = match mutation.store() {
        Some(name) => name,
        None => return Ok(()),
    };
    if cleared.contains(store_name) {
        // The store's retention dropped its contents at open; committed
        // opportunistic writes vanish with it.
        return Ok(());
    }
    let store = registry.get(store_name)?;

    match mutation {
        LogEntry::Put { tuple, .. } => store.store(tuple.clone()),
        LogEntry::Update { id, payload, .. } => {
            let mut tuple = store.retrieve(*id).map_err(|_| inconsistency(store_name, *id, "update"))?;
            tuple.payload = payload.clone();
            store.store(tuple)
        }
        LogEntry::UpdateMeta { id, lock_id, .. } => {
            let mut tuple = store.retrieve(*id).map_err(|_| inconsistency(store_name, *id, "metadata update"))?;
            tuple.lock_id = *lock_id;
            store.store(tuple)
        }
        LogEntry::Remove { id, .. } => store
            .remove(*id)
            .map_err(|_| inconsistency(store_name, *id, "remove")),
        _ => Ok(()),
    }
}

fn inconsistency(store: &str, id: mqstore_core::TupleId, action: &str) -> Error {
    Error::RecoveryInconsistency {
        store: store.to_string(),
        detail: format!("committed {} of tuple {} the store cannot produce", action, id),
    }
}
