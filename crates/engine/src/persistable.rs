//! The adapter between in-memory entities and durable tuples
//!
//! A [`Persistable`] owns one entity's durable lifecycle: its tuple id, its
//! lock stamp, and the registration of add/update/remove operations on a
//! transaction. The id is assigned exactly once, at the first add, and kept
//! through rollback; a retried add re-registers the same tuple under a fresh
//! transaction and the store's upsert semantics make the retry converge.
//!
//! The persistable holds its item weakly. The item's owner (the stream, or
//! the consumer holding it) controls its lifetime; a persistable driven
//! after the item is gone is a protocol violation and fails fast.

use crate::item::Item;
use mqstore_core::{Error, LockId, Result, StoreName, Tuple, TupleId, TupleType};
use mqstore_txn::{Operation, Transaction};
use std::sync::{Arc, Weak};

use crate::object_manager::ObjectManager;

/// Where a persistable's payload bytes come from
#[derive(Debug)]
enum PayloadSource {
    /// Live item; payload serialized from its current chunks at each write
    Item(Weak<Item>),
    /// Fixed bytes captured at creation (stream records)
    Fixed(Vec<u8>),
}

/// One entity's durable lifecycle
#[derive(Debug)]
pub struct Persistable {
    source: PayloadSource,
    store: StoreName,
    tuple_type: TupleType,
    id: Option<TupleId>,
    lock_id: LockId,
}

impl Persistable {
    /// Persistable for an item, writing to `store`
    pub fn for_item(item: &Arc<Item>, store: StoreName) -> Self {
        Persistable {
            source: PayloadSource::Item(Arc::downgrade(item)),
            store,
            tuple_type: TupleType::Item,
            id: None,
            lock_id: LockId::default(),
        }
    }

    /// Persistable over fixed payload bytes
    pub fn fixed(payload: Vec<u8>, store: StoreName, tuple_type: TupleType) -> Self {
        Persistable {
            source: PayloadSource::Fixed(payload),
            store,
            tuple_type,
            id: None,
            lock_id: LockId::default(),
        }
    }

    /// Persistable rebound to an item's already-durable tuple at recovery
    pub fn recovered(item: &Arc<Item>, store: StoreName, id: TupleId, lock_id: LockId) -> Self {
        Persistable {
            source: PayloadSource::Item(Arc::downgrade(item)),
            store,
            tuple_type: TupleType::Item,
            id: Some(id),
            lock_id,
        }
    }

    /// Assigned tuple id, `None` before the first add
    pub fn tuple_id(&self) -> Option<TupleId> {
        self.id
    }

    /// Current lock stamp
    pub fn lock_id(&self) -> LockId {
        self.lock_id
    }

    /// Store this persistable writes to
    pub fn store(&self) -> &str {
        &self.store
    }

    /// Register this entity's add under `txn`
    ///
    /// Assigns the tuple id on the first call and reuses it on every later
    /// one, so an add retried after a rollback lands on the same tuple.
    pub fn add_to_store(&mut self, txn: &mut Transaction, manager: &ObjectManager) -> Result<()> {
        let id = match self.id {
            Some(id) => id,
            None => {
                let id = manager.allocate_tuple_id();
                self.id = Some(id);
                id
            }
        };
        let mut tuple = Tuple::new(id, self.tuple_type, self.payload()?);
        tuple.lock_id = self.lock_id;
        txn.register(Operation::Put {
            store: self.store.clone(),
            tuple,
        })
    }

    /// Register a payload rewrite under `txn`
    pub fn update_data_only(&mut self, txn: &mut Transaction) -> Result<()> {
        let id = self.persisted_id()?;
        let payload = self.payload()?;
        txn.register(Operation::Update {
            store: self.store.clone(),
            id,
            payload,
        })
    }

    /// Set the lock stamp the next metadata update will persist
    ///
    /// Stamps only ever grow; callers advance with `lock_id().next()`.
    pub fn set_lock_id(&mut self, lock_id: LockId) {
        self.lock_id = lock_id;
    }

    /// Register a lock-stamp write under `txn`, leaving the payload untouched
    ///
    /// Persists the stamp last set with [`Persistable::set_lock_id`].
    /// Registration never advances the stamp, so an update retried after a
    /// rollback writes the same value a single application would have.
    pub fn update_metadata_only(&mut self, txn: &mut Transaction) -> Result<()> {
        let id = self.persisted_id()?;
        txn.register(Operation::UpdateMeta {
            store: self.store.clone(),
            id,
            lock_id: self.lock_id,
        })
    }

    /// Register this entity's removal under `txn`
    ///
    /// The tuple id is retained: a removal retried after a rollback names
    /// the same tuple, and a later re-add reuses it.
    pub fn remove_from_store(&mut self, txn: &mut Transaction) -> Result<()> {
        let id = self.persisted_id()?;
        txn.register(Operation::Remove {
            store: self.store.clone(),
            id,
        })
    }

    fn persisted_id(&self) -> Result<TupleId> {
        self.id.ok_or_else(|| Error::PersistableMisuse {
            store: self.store.clone(),
            detail: "operation on an entity never added to its store",
        })
    }

    fn payload(&self) -> Result<Vec<u8>> {
        match &self.source {
            PayloadSource::Item(weak) => match weak.upgrade() {
                Some(item) => item.to_payload(),
                None => Err(Error::PersistableMisuse {
                    store: self.store.clone(),
                    detail: "backing item no longer exists",
                }),
            },
            PayloadSource::Fixed(bytes) => Ok(bytes.clone()),
        }
    }
}
