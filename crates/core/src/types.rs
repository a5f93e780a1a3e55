//! Identity and tuple types
//!
//! Every durable entity (an item or an item stream) is represented on disk as
//! a [`Tuple`]: an assigned [`TupleId`], a [`TupleType`] tag, a [`LockId`]
//! version stamp, and an opaque payload. Ids are process-unique, assigned at
//! first persistence, and stable for the entity's lifetime.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Process-unique identifier of a durable tuple
///
/// Assigned once, at the first `add` of the owning entity, by a monotone
/// counter seeded above the highest id observed during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleId(u64);

impl TupleId {
    /// Wrap a raw id value
    pub fn new(raw: u64) -> Self {
        TupleId(raw)
    }

    /// Raw id value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Per-tuple version stamp
///
/// Bumped on every successful metadata update; lets callers detect stale
/// writes without re-reading the payload.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LockId(u64);

impl LockId {
    /// Wrap a raw lock value
    pub fn new(raw: u64) -> Self {
        LockId(raw)
    }

    /// Raw lock value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The next stamp in sequence
    pub fn next(&self) -> LockId {
        LockId(self.0 + 1)
    }
}

/// Local transaction identifier
///
/// Unique within one log's lifetime; allocation restarts above the maximum
/// id found in the log at recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(u64);

impl TxnId {
    /// Wrap a raw transaction id
    pub fn new(raw: u64) -> Self {
        TxnId(raw)
    }

    /// Raw transaction id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn{}", self.0)
    }
}

/// Global transaction id supplied by an external coordinator
///
/// The resource-manager side of the two-phase protocol is keyed by this
/// value. Shape follows the conventional coordinator id: a format
/// discriminator plus global-transaction and branch byte strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    /// Coordinator format discriminator
    pub format_id: i32,
    /// Global transaction id bytes
    pub global_txn_id: Vec<u8>,
    /// Branch qualifier bytes
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    /// Build an xid from its three components
    pub fn new(format_id: i32, global_txn_id: Vec<u8>, branch_qualifier: Vec<u8>) -> Self {
        Xid {
            format_id,
            global_txn_id,
            branch_qualifier,
        }
    }

    /// Fabricate a unique xid (tests and single-process coordinators)
    pub fn generate() -> Self {
        Xid {
            format_id: 0x4d51,
            global_txn_id: Uuid::new_v4().as_bytes().to_vec(),
            branch_qualifier: vec![1],
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid({:x},", self.format_id)?;
        for b in &self.global_txn_id {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ",")?;
        for b in &self.branch_qualifier {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

// ============================================================================
// Names and policies
// ============================================================================

/// Name of a registered object store
pub type StoreName = String;

/// What kind of entity a tuple represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TupleType {
    /// A queue item
    Item,
    /// An item stream (itself a persisted record)
    ItemStream,
}

/// Per-item persistence policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageStrategy {
    /// Always written to a permanent store before becoming visible
    StoreAlways,
    /// Persisted opportunistically; may be dropped on crash
    StoreMaybe,
    /// Memory-only, never touches a store
    StoreNever,
}

/// Per-store retention policy, consulted only at store-open time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Honor prior contents across restarts
    KeepAlways,
    /// Discard prior contents when the store is next opened
    KeepUntilNextOpen,
}

// ============================================================================
// Tuple
// ============================================================================

/// Durable on-disk representation of one persisted entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    /// Assigned id, stable for the entity's lifetime
    pub id: TupleId,
    /// Entity kind tag
    pub tuple_type: TupleType,
    /// Version stamp, bumped on metadata updates
    pub lock_id: LockId,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

impl Tuple {
    /// Build a tuple with an initial (zero) lock stamp
    pub fn new(id: TupleId, tuple_type: TupleType, payload: Vec<u8>) -> Self {
        Tuple {
            id,
            tuple_type,
            lock_id: LockId::default(),
            payload,
        }
    }

    /// Bytes this tuple accounts for against store capacity
    ///
    /// Payload plus a fixed per-tuple overhead for id, type and lock fields.
    pub fn stored_size(&self) -> u64 {
        self.payload.len() as u64 + 32
    }
}
