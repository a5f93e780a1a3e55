//! Object stores: keyed tuple persistence
//!
//! An [`ObjectStore`] is a dumb persistence surface: store/retrieve/remove a
//! tuple by id. It holds no transaction logic; every mutation reaches it
//! through the log-coordinated commit path. Its one decision point is the
//! retention policy, consulted at open time.
//!
//! On disk each store is a single CRC-protected snapshot file, rewritten at
//! checkpoint and shutdown. Between snapshots the log is the source of truth.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod object_store;
pub mod registry;

pub use object_store::ObjectStore;
pub use registry::StoreRegistry;
