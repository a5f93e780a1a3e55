//! Transactions for the object store
//!
//! A [`Transaction`] is the unit of atomicity: it accumulates pending tuple
//! operations and tracks only which tuples it enlisted — deliberately not
//! the callers' own bookkeeping, which is what makes rollback-retry safe.
//! The [`TransactionManager`] drives the durable protocol: capacity
//! reservation, log writes, the fsynced decision marker, then application to
//! the stores.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manager;
pub mod transaction;

pub use manager::{PrepareOutcome, TransactionManager};
pub use transaction::{Operation, Transaction, TransactionState};
