//! File-backed keyed tuple store
//!
//! In memory the store is a hash index of tuples plus a used-bytes counter.
//! On disk it is one snapshot file:
//!
//! ```text
//! [magic: u32][payload_len: u32][payload: bincode image][crc32: u32]
//! ```
//!
//! CRC covers the payload only. A snapshot is written atomically (temp file
//! then rename), so a crash mid-checkpoint leaves the previous image intact.

use mqstore_core::{Error, Result, RetentionPolicy, StoreName, Tuple, TupleId, TupleType};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Snapshot file magic: "MQOS"
const SNAPSHOT_MAGIC: u32 = 0x4d514f53;

/// Serialized image of a store's contents
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotImage {
    name: StoreName,
    tuples: Vec<Tuple>,
}

/// A named, strategy-tagged persistence target
///
/// Thread-safe: reads take a shared lock on the index, mutations an
/// exclusive one. The commit path is the only writer in practice.
#[derive(Debug)]
pub struct ObjectStore {
    name: StoreName,
    retention: RetentionPolicy,
    path: PathBuf,
    max_bytes: u64,
    index: RwLock<FxHashMap<TupleId, Tuple>>,
    used_bytes: AtomicU64,
}

impl ObjectStore {
    /// Open a store at `path`, honoring its retention policy
    ///
    /// `KeepAlways` loads a prior snapshot when one exists; `KeepUntilNextOpen`
    /// discards any prior snapshot and starts empty. Returns the store and
    /// whether prior durable content was found on disk.
    pub fn open<P: AsRef<Path>>(
        name: impl Into<StoreName>,
        path: P,
        retention: RetentionPolicy,
        max_bytes: u64,
    ) -> Result<(Self, bool)> {
        let name = name.into();
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let prior_content = path.exists();
        let store = ObjectStore {
            name,
            retention,
            path,
            max_bytes,
            index: RwLock::new(FxHashMap::default()),
            used_bytes: AtomicU64::new(0),
        };

        match (prior_content, retention) {
            (true, RetentionPolicy::KeepAlways) => {
                store.load_snapshot()?;
                info!(
                    store = %store.name,
                    tuples = store.len(),
                    "opened store from prior snapshot"
                );
            }
            (true, RetentionPolicy::KeepUntilNextOpen) => {
                fs::remove_file(&store.path)?;
                info!(store = %store.name, "discarded prior snapshot on open");
            }
            (false, _) => {
                debug!(store = %store.name, "opened empty store");
            }
        }

        Ok((store, prior_content))
    }

    /// Store name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Retention policy this store was opened with
    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Configured capacity cap in bytes
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Bytes currently accounted against capacity
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    /// Number of tuples present
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// True when no tuples are present
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Check that `additional` bytes would still fit under the cap
    ///
    /// The commit path calls this for every target store before the first
    /// log write, so a refused transaction leaves no trace.
    pub fn ensure_capacity(&self, additional: u64) -> Result<()> {
        let used = self.used_bytes();
        if used + additional > self.max_bytes {
            return Err(Error::PersistenceFull {
                store: self.name.clone(),
                requested: additional,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Insert or replace a tuple
    ///
    /// Upsert semantics: re-storing the same id replaces the previous image
    /// and adjusts accounting, which is what makes a retried add converge.
    pub fn store(&self, tuple: Tuple) -> Result<()> {
        let mut index = self.index.write();
        let new_size = tuple.stored_size();
        if let Some(prior) = index.insert(tuple.id, tuple) {
            self.used_bytes
                .fetch_sub(prior.stored_size(), Ordering::SeqCst);
        }
        self.used_bytes.fetch_add(new_size, Ordering::SeqCst);
        Ok(())
    }

    /// Retrieve a tuple by id
    pub fn retrieve(&self, id: TupleId) -> Result<Tuple> {
        self.index
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::TupleNotFound {
                store: self.name.clone(),
                id,
            })
    }

    /// Remove a tuple by id
    pub fn remove(&self, id: TupleId) -> Result<()> {
        let mut index = self.index.write();
        match index.remove(&id) {
            Some(prior) => {
                self.used_bytes
                    .fetch_sub(prior.stored_size(), Ordering::SeqCst);
                Ok(())
            }
            None => Err(Error::TupleNotFound {
                store: self.name.clone(),
                id,
            }),
        }
    }

    /// True when a tuple with this id is present
    pub fn contains(&self, id: TupleId) -> bool {
        self.index.read().contains_key(&id)
    }

    /// Number of tuples of one type
    pub fn count_by_type(&self, tuple_type: TupleType) -> usize {
        self.index
            .read()
            .values()
            .filter(|t| t.tuple_type == tuple_type)
            .count()
    }

    /// Ids of tuples of one type, in ascending id order
    pub fn ids_by_type(&self, tuple_type: TupleType) -> Vec<TupleId> {
        let mut ids: Vec<TupleId> = self
            .index
            .read()
            .values()
            .filter(|t| t.tuple_type == tuple_type)
            .map(|t| t.id)
            .collect();
        ids.sort();
        ids
    }

    /// Ids of all tuples present, unordered
    pub fn tuple_ids(&self) -> Vec<TupleId> {
        self.index.read().keys().copied().collect()
    }

    /// Highest tuple id present, if any
    pub fn max_tuple_id(&self) -> Option<TupleId> {
        self.index.read().keys().max().copied()
    }

    /// Drop all tuples (store-clearing reopen, `Clear` mode)
    pub fn clear(&self) {
        self.index.write().clear();
        self.used_bytes.store(0, Ordering::SeqCst);
    }

    /// Write the current contents to the snapshot file
    ///
    /// Atomic: written to `<path>.tmp` then renamed over the live file.
    pub fn write_snapshot(&self) -> Result<()> {
        let image = {
            let index = self.index.read();
            SnapshotImage {
                name: self.name.clone(),
                tuples: index.values().cloned().collect(),
            }
        };
        let payload = bincode::serialize(&image)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&SNAPSHOT_MAGIC.to_le_bytes())?;
            file.write_all(&(payload.len() as u32).to_le_bytes())?;
            file.write_all(&payload)?;
            file.write_all(&crc.to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!(store = %self.name, tuples = image.tuples.len(), "snapshot written");
        Ok(())
    }

    /// Load the snapshot file into the index
    fn load_snapshot(&self) -> Result<()> {
        let mut file = File::open(&self.path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        if buf.len() < 12 {
            return Err(Error::Corruption(format!(
                "store '{}': snapshot file too short ({} bytes)",
                self.name,
                buf.len()
            )));
        }

        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::Corruption(format!(
                "store '{}': bad snapshot magic {:08x}",
                self.name, magic
            )));
        }

        let payload_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if buf.len() != 8 + payload_len + 4 {
            return Err(Error::Corruption(format!(
                "store '{}': snapshot length mismatch (declared {}, file {})",
                self.name,
                payload_len,
                buf.len()
            )));
        }

        let payload = &buf[8..8 + payload_len];
        let expected_crc = u32::from_le_bytes([
            buf[8 + payload_len],
            buf[9 + payload_len],
            buf[10 + payload_len],
            buf[11 + payload_len],
        ]);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != expected_crc {
            return Err(Error::Corruption(format!(
                "store '{}': snapshot CRC mismatch",
                self.name
            )));
        }

        let image: SnapshotImage = bincode::deserialize(payload)?;
        let mut index = self.index.write();
        let mut used = 0u64;
        for tuple in image.tuples {
            used += tuple.stored_size();
            index.insert(tuple.id, tuple);
        }
        self.used_bytes.store(used, Ordering::SeqCst);
        Ok(())
    }
}
