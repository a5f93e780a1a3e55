//! Store registry
//!
//! Name-keyed map of the object stores one object manager owns. Lookup of an
//! unregistered name is the `UnknownStore` failure the manager surfaces to
//! callers asking for a store its metadata cannot identify.

use crate::object_store::ObjectStore;
use dashmap::DashMap;
use mqstore_core::{Error, Result, StoreName};
use std::sync::Arc;

/// Name-keyed collection of object stores
#[derive(Default)]
pub struct StoreRegistry {
    stores: DashMap<StoreName, Arc<ObjectStore>>,
}

impl StoreRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under its own name
    pub fn register(&self, store: Arc<ObjectStore>) {
        self.stores.insert(store.name().to_string(), store);
    }

    /// Resolve a registered store by name
    pub fn get(&self, name: &str) -> Result<Arc<ObjectStore>> {
        self.stores
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::UnknownStore(name.to_string()))
    }

    /// All registered stores, unordered
    pub fn all(&self) -> Vec<Arc<ObjectStore>> {
        self.stores
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of registered stores
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// True when no stores are registered
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
