//! Items and item streams
//!
//! An [`Item`] is one queue entry: ordered payload chunks plus the storage
//! strategy that decides which store (if any) it is written to. An
//! [`ItemStream`] is the ordered collection items are put to and removed
//! from; the stream is itself a persisted entity, so a warm start can find
//! it again by name.
//!
//! Durable membership of a stream is whatever its backing store holds;
//! the in-process list kept here is the live view handed to consumers and
//! is rebuilt from the store at reopen.

use crate::object_manager::ObjectManager;
use crate::persistable::Persistable;
use mqstore_core::{
    Error, Result, StorageStrategy, StoreName, TupleId, TupleType, PERMANENT_STORE,
    TEMPORARY_STORE,
};
use parking_lot::{Mutex, RwLock};
use mqstore_txn::Transaction;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Fixed per-item accounting overhead beyond the payload bytes
const ITEM_OVERHEAD: u64 = 32;

/// Durable image of an item
#[derive(Debug, Serialize, Deserialize)]
struct ItemImage {
    strategy: StorageStrategy,
    chunks: Vec<Vec<u8>>,
}

/// Durable image of a stream's own record
#[derive(Debug, Serialize, Deserialize)]
struct StreamImage {
    name: String,
}

/// One queue entry: payload chunks plus a storage strategy
pub struct Item {
    strategy: StorageStrategy,
    chunks: RwLock<Vec<Vec<u8>>>,
}

impl Item {
    /// Item with a single payload chunk
    pub fn new(payload: Vec<u8>, strategy: StorageStrategy) -> Arc<Self> {
        Arc::new(Item {
            strategy,
            chunks: RwLock::new(vec![payload]),
        })
    }

    /// Item from pre-sliced payload chunks
    pub fn from_chunks(chunks: Vec<Vec<u8>>, strategy: StorageStrategy) -> Arc<Self> {
        Arc::new(Item {
            strategy,
            chunks: RwLock::new(chunks),
        })
    }

    /// Storage strategy this item was created with
    pub fn strategy(&self) -> StorageStrategy {
        self.strategy
    }

    /// Append one payload chunk
    ///
    /// Growth after first persistence is only made durable by a subsequent
    /// data update through the item's persistable.
    pub fn append_chunk(&self, chunk: Vec<u8>) {
        self.chunks.write().push(chunk);
    }

    /// Full payload, chunks concatenated in order
    pub fn payload(&self) -> Vec<u8> {
        let chunks = self.chunks.read();
        let mut out = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
        for chunk in chunks.iter() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Payload bytes across all chunks
    pub fn payload_len(&self) -> usize {
        self.chunks.read().iter().map(Vec::len).sum()
    }

    /// Bytes this item accounts for in stream statistics
    pub fn size_estimate(&self) -> u64 {
        self.payload_len() as u64 + ITEM_OVERHEAD
    }

    /// Store this item's strategy maps to, `None` for memory-only
    pub fn target_store(&self) -> Option<&'static str> {
        match self.strategy {
            StorageStrategy::StoreAlways => Some(PERMANENT_STORE),
            StorageStrategy::StoreMaybe => Some(TEMPORARY_STORE),
            StorageStrategy::StoreNever => None,
        }
    }

    /// Serialize to the tuple payload written at persistence
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let image = ItemImage {
            strategy: self.strategy,
            chunks: self.chunks.read().clone(),
        };
        Ok(bincode::serialize(&image)?)
    }

    /// Rebuild an item from a recovered tuple payload
    pub fn from_payload(payload: &[u8]) -> Result<Arc<Self>> {
        let image: ItemImage = bincode::deserialize(payload)?;
        Ok(Arc::new(Item {
            strategy: image.strategy,
            chunks: RwLock::new(image.chunks),
        }))
    }
}

/// An item recovered from a backing store, paired with its persistable
pub struct RecoveredItem {
    /// The reconstructed in-memory item
    pub item: Arc<Item>,
    /// Persistable already bound to the item's durable tuple
    pub persistable: Persistable,
}

/// Ordered, persisted collection of items
///
/// The stream's own record lives in the permanent store, so the stream is
/// found again by name across restarts regardless of what happened to its
/// items.
pub struct ItemStream {
    name: String,
    tuple_id: TupleId,
    items: Mutex<Vec<Arc<Item>>>,
    total_bytes: AtomicU64,
}

impl ItemStream {
    /// Find the stream record named `name`, creating it if absent
    ///
    /// Returns the stream and whether it had to be created. Creation runs
    /// in its own committed transaction; the record is durable before the
    /// stream is handed out.
    pub fn find_or_create(name: &str, manager: &ObjectManager) -> Result<(Arc<Self>, bool)> {
        let store = manager.object_store(PERMANENT_STORE)?;

        for id in store.ids_by_type(TupleType::ItemStream) {
            let tuple = store.retrieve(id)?;
            let image: StreamImage = bincode::deserialize(&tuple.payload)?;
            if image.name == name {
                debug!(stream = name, id = %id, "resumed existing item stream");
                return Ok((
                    Arc::new(ItemStream {
                        name: image.name,
                        tuple_id: id,
                        items: Mutex::new(Vec::new()),
                        total_bytes: AtomicU64::new(0),
                    }),
                    false,
                ));
            }
        }

        let payload = bincode::serialize(&StreamImage {
            name: name.to_string(),
        })?;
        let mut persistable =
            Persistable::fixed(payload, PERMANENT_STORE.to_string(), TupleType::ItemStream);
        let mut txn = manager.begin_transaction();
        persistable.add_to_store(&mut txn, manager)?;
        manager.commit(&mut txn)?;

        let tuple_id = match persistable.tuple_id() {
            Some(id) => id,
            None => {
                return Err(Error::PersistableMisuse {
                    store: PERMANENT_STORE.to_string(),
                    detail: "stream record committed without an assigned id",
                })
            }
        };
        info!(stream = name, id = %tuple_id, "created item stream");
        Ok((
            Arc::new(ItemStream {
                name: name.to_string(),
                tuple_id,
                items: Mutex::new(Vec::new()),
                total_bytes: AtomicU64::new(0),
            }),
            true,
        ))
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the stream's own durable record
    pub fn tuple_id(&self) -> TupleId {
        self.tuple_id
    }

    /// Register an item's first persistence under `txn`
    ///
    /// Returns the persistable driving the item's durable lifecycle, or
    /// `None` for a memory-only item. The item becomes a live member of the
    /// stream via [`ItemStream::attach`] once the transaction commits.
    pub fn put(
        &self,
        item: &Arc<Item>,
        txn: &mut Transaction,
        manager: &ObjectManager,
    ) -> Result<Option<Persistable>> {
        let store: StoreName = match item.target_store() {
            Some(name) => name.to_string(),
            None => return Ok(None),
        };
        let mut persistable = Persistable::for_item(item, store);
        persistable.add_to_store(txn, manager)?;
        Ok(Some(persistable))
    }

    /// Register an item's removal under `txn`
    pub fn remove(&self, persistable: &mut Persistable, txn: &mut Transaction) -> Result<()> {
        persistable.remove_from_store(txn)
    }

    /// Make an item a live member of the stream
    pub fn attach(&self, item: Arc<Item>) {
        self.total_bytes
            .fetch_add(item.size_estimate(), Ordering::SeqCst);
        self.items.lock().push(item);
    }

    /// Drop an item from the live membership
    ///
    /// Returns whether the item was a member.
    pub fn detach(&self, item: &Arc<Item>) -> bool {
        let mut items = self.items.lock();
        match items.iter().position(|member| Arc::ptr_eq(member, item)) {
            Some(position) => {
                let removed = items.remove(position);
                self.total_bytes
                    .fetch_sub(removed.size_estimate(), Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Number of live member items
    pub fn item_count(&self) -> usize {
        self.items.lock().len()
    }

    /// Payload bytes (plus per-item overhead) across live members
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    /// Live members in insertion order
    pub fn items(&self) -> Vec<Arc<Item>> {
        self.items.lock().clone()
    }

    /// Number of items durably present in the permanent store
    pub fn durable_item_count(&self, manager: &ObjectManager) -> Result<usize> {
        Ok(manager
            .object_store(PERMANENT_STORE)?
            .count_by_type(TupleType::Item))
    }

    /// Rebuild live membership from the backing stores after a warm start
    ///
    /// Items come back in ascending id order, which is insertion order for
    /// ids assigned by the monotone allocator. Each recovered item carries a
    /// persistable already bound to its tuple, so removal works without a
    /// fresh add.
    pub fn reload(&self, manager: &ObjectManager) -> Result<Vec<RecoveredItem>> {
        let mut recovered = Vec::new();
        for store_name in [PERMANENT_STORE, TEMPORARY_STORE] {
            let store = manager.object_store(store_name)?;
            for id in store.ids_by_type(TupleType::Item) {
                let tuple = store.retrieve(id)?;
                let item = Item::from_payload(&tuple.payload)?;
                let persistable = Persistable::recovered(
                    &item,
                    store_name.to_string(),
                    id,
                    tuple.lock_id,
                );
                self.attach(Arc::clone(&item));
                recovered.push(RecoveredItem { item, persistable });
            }
        }
        debug!(
            stream = %self.name,
            items = recovered.len(),
            "stream membership reloaded"
        );
        Ok(recovered)
    }
}
