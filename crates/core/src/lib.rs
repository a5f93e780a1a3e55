//! Core types for the mqstore object store
//!
//! Shared vocabulary used by every other crate in the workspace:
//! - Tuple identity and versioning ([`types`])
//! - The error taxonomy ([`error`])
//! - Store configuration ([`config`])
//!
//! This crate has no I/O of its own.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{SizeBounds, StoreConfig, PERMANENT_STORE, TEMPORARY_STORE};
pub use error::{AdmissionCode, Error, Result};
pub use types::{
    LockId, RetentionPolicy, StorageStrategy, StoreName, Tuple, TupleId, TupleType, TxnId, Xid,
};
