//! Local inventory of resources known to the platform.
//!
//! Updates and deletes are only attempted for resources the inventory
//! knows; a successful delete removes the row.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::ResourceRef;

/// Inventory backend failure.
#[derive(Debug, Error)]
#[error("inventory error: {0}")]
pub struct InventoryError(pub String);

#[async_trait]
pub trait LocalInventory: Send + Sync {
    async fn contains(&self, resource: &ResourceRef) -> Result<bool, InventoryError>;

    /// Remove `resource`. Removing an absent row is not an error.
    async fn remove(&self, resource: &ResourceRef) -> Result<(), InventoryError>;
}

/// In-memory inventory.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    rows: Mutex<HashSet<ResourceRef>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource: ResourceRef) {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LocalInventory for MemoryInventory {
    async fn contains(&self, resource: &ResourceRef) -> Result<bool, InventoryError> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(resource))
    }

    async fn remove(&self, resource: &ResourceRef) -> Result<(), InventoryError> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(resource);
        Ok(())
    }
}
