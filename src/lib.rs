//! mqstore - transactional log-structured object store for a message queue
//!
//! The store persists queue items through a write-ahead log plus per-store
//! snapshot files. Every mutation travels inside a transaction; a
//! transaction is durable once its decision marker is fsynced, and a warm
//! start replays the log over the snapshots to reconstruct exactly the
//! committed state. Two stores back the queue: the permanent store keeps
//! its contents across restarts, the temporary store is discarded at every
//! open, which is what gives opportunistically-persisted items their
//! may-vanish semantics.
//!
//! The [`MessageStore`] is the hosting-runtime facade: an interruptible
//! retrying startup, a health state, the root item stream, and convenience
//! put/remove operations that each run in their own committed transaction.
//! Everything it wraps is available directly for callers that drive their
//! own transactions, including the resource-manager side of two-phase
//! commit on [`ObjectManager`].
//!
//! ```no_run
//! use mqstore::{Item, MessageStore, OpenMode, StartOutcome, StorageStrategy, StoreConfig};
//!
//! # fn main() -> mqstore::Result<()> {
//! let store = MessageStore::new(StoreConfig::rooted_at("/var/lib/mq"));
//! match store.start(OpenMode::Warm)? {
//!     StartOutcome::Started { warm } => {
//!         let item = Item::new(b"payload".to_vec(), StorageStrategy::StoreAlways);
//!         let _persistable = store.put(&item)?;
//!         let _ = warm;
//!     }
//!     StartOutcome::Interrupted => {}
//!     StartOutcome::Failed { error } => return Err(error),
//! }
//! store.stop()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod message_store;

pub use message_store::{HealthState, MessageStore, StartOutcome, ROOT_STREAM};

pub use mqstore_core::{
    AdmissionCode, Error, LockId, Result, RetentionPolicy, SizeBounds, StorageStrategy,
    StoreConfig, Tuple, TupleId, TupleType, TxnId, Xid, PERMANENT_STORE, TEMPORARY_STORE,
};
pub use mqstore_engine::{
    AdmissionPolicy, ContextCategory, Item, ItemStream, ObjectManager, Persistable,
    RecoveredItem, WorkContext,
};
pub use mqstore_log::{LogEntry, LogFile, OpenMode};
pub use mqstore_store::ObjectStore;
pub use mqstore_txn::{Operation, PrepareOutcome, Transaction, TransactionState};
