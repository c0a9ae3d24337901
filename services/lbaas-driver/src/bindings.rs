//! Tenant bindings: persisted tenant -> device placement overrides.
//!
//! A binding is created the first time a tenant is resolved in
//! binding mode and then wins over the ring for as long as its device stays
//! in the registry. Stores must keep at most one binding per tenant and
//! treat a racing duplicate insert as success.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lbaas_id::{DeviceId, TenantId};
use serde::Serialize;
use thiserror::Error;

use crate::db::DbError;

/// A persisted tenant -> device assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantBinding {
    pub tenant_id: TenantId,
    pub device_id: DeviceId,
    pub created_at: DateTime<Utc>,
}

/// Binding store errors.
#[derive(Debug, Error)]
pub enum BindingStoreError {
    /// Another writer bound the tenant first. Resolved by re-reading.
    #[error("binding for tenant {tenant_id} already exists")]
    Conflict { tenant_id: TenantId },

    #[error(transparent)]
    Database(#[from] DbError),

    /// A stored row failed ID validation.
    #[error("invalid binding row: {0}")]
    InvalidRow(String),
}

/// Persistence for tenant bindings.
#[async_trait]
pub trait BindingStore: Send + Sync {
    /// The binding for `tenant_id`, if any.
    async fn get(&self, tenant_id: &TenantId) -> Result<Option<TenantBinding>, BindingStoreError>;

    /// Bind `tenant_id` to `device_id` unless it is already bound.
    ///
    /// Returns the binding that is persisted afterwards, which is the
    /// existing one when the tenant was already bound.
    async fn insert_if_absent(
        &self,
        tenant_id: &TenantId,
        device_id: &DeviceId,
    ) -> Result<TenantBinding, BindingStoreError>;

    /// Overwrite the binding for `tenant_id`.
    async fn replace(
        &self,
        tenant_id: &TenantId,
        device_id: &DeviceId,
    ) -> Result<TenantBinding, BindingStoreError>;
}

/// In-memory binding store.
#[derive(Debug, Default)]
pub struct MemoryBindingStore {
    bindings: Mutex<HashMap<TenantId, TenantBinding>>,
}

impl MemoryBindingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All bindings, ordered by tenant.
    pub fn bindings(&self) -> Vec<TenantBinding> {
        let mut all: Vec<_> = self
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        all
    }
}

#[async_trait]
impl BindingStore for MemoryBindingStore {
    async fn get(&self, tenant_id: &TenantId) -> Result<Option<TenantBinding>, BindingStoreError> {
        Ok(self
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant_id)
            .cloned())
    }

    async fn insert_if_absent(
        &self,
        tenant_id: &TenantId,
        device_id: &DeviceId,
    ) -> Result<TenantBinding, BindingStoreError> {
        let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        let binding = bindings
            .entry(tenant_id.clone())
            .or_insert_with(|| TenantBinding {
                tenant_id: tenant_id.clone(),
                device_id: device_id.clone(),
                created_at: Utc::now(),
            });
        Ok(binding.clone())
    }

    async fn replace(
        &self,
        tenant_id: &TenantId,
        device_id: &DeviceId,
    ) -> Result<TenantBinding, BindingStoreError> {
        let binding = TenantBinding {
            tenant_id: tenant_id.clone(),
            device_id: device_id.clone(),
            created_at: Utc::now(),
        };
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id.clone(), binding.clone());
        Ok(binding)
    }
}
