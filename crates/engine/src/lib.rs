//! Object manager and entity layer
//!
//! Ties the lower crates together into the surface the message store uses:
//! - [`object_manager`] owns the log, the stores and the transaction
//!   protocol, including the resource-manager side of two-phase commit
//! - [`persistable`] adapts an in-memory entity to the tuple operations a
//!   transaction can carry, with the id stability that makes rollback-retry
//!   converge
//! - [`item`] holds the queue-facing entities: payload-carrying items and
//!   the streams that group them
//! - [`admission`] screens a unit of work's contexts before any of its
//!   writes are accepted

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admission;
pub mod item;
pub mod object_manager;
pub mod persistable;

pub use admission::{AdmissionPolicy, ContextCategory, WorkContext};
pub use item::{Item, ItemStream, RecoveredItem};
pub use object_manager::ObjectManager;
pub use persistable::Persistable;
