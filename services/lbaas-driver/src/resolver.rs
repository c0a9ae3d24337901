//! Tenant -> device resolution.
//!
//! Two placement modes:
//! - `Hash`: the ring alone decides.
//! - `HashWithBinding`: an existing binding wins as long as its device is
//!   still registered; otherwise the ring decides and, for a first
//!   resolution, the result is persisted as the tenant's binding.
//!
//! The resolver holds no locks of its own. The registry hands out immutable
//! snapshots and the binding store owns the check-and-insert.

use std::str::FromStr;
use std::sync::Arc;

use lbaas_id::TenantId;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::bindings::{BindingStore, BindingStoreError};
use crate::registry::{Device, DeviceRegistry, DeviceSnapshot};

/// Resolution errors.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The registry has no devices.
    #[error("no devices configured")]
    NoDevicesConfigured,

    #[error("binding store error: {0}")]
    Binding(#[from] BindingStoreError),
}

/// How tenants are placed on devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementMode {
    #[default]
    Hash,
    HashWithBinding,
}

/// What to do with a binding whose device left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleBindingPolicy {
    /// Resolve through the ring and leave the binding untouched, so the
    /// tenant returns to its device if it is registered again.
    #[default]
    Keep,

    /// Resolve through the ring and overwrite the binding with the result.
    Rebind,
}

impl FromStr for StaleBindingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "rebind" => Ok(Self::Rebind),
            other => Err(format!("unknown stale binding policy '{other}' (expected keep or rebind)")),
        }
    }
}

/// Computes which device handles a tenant.
pub struct DeviceResolver {
    registry: Arc<dyn DeviceRegistry>,
    bindings: Option<Arc<dyn BindingStore>>,
    stale_policy: StaleBindingPolicy,
}

impl DeviceResolver {
    /// Resolver using the ring only.
    pub fn hash_only(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self {
            registry,
            bindings: None,
            stale_policy: StaleBindingPolicy::Keep,
        }
    }

    /// Resolver with persisted bindings.
    pub fn with_bindings(
        registry: Arc<dyn DeviceRegistry>,
        bindings: Arc<dyn BindingStore>,
        stale_policy: StaleBindingPolicy,
    ) -> Self {
        Self {
            registry,
            bindings: Some(bindings),
            stale_policy,
        }
    }

    pub fn mode(&self) -> PlacementMode {
        if self.bindings.is_some() {
            PlacementMode::HashWithBinding
        } else {
            PlacementMode::Hash
        }
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    /// The device handling `tenant_id`.
    #[instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn resolve(&self, tenant_id: &TenantId) -> Result<Device, ResolveError> {
        let snapshot = self.registry.snapshot();

        let device = match &self.bindings {
            None => hashed(&snapshot, tenant_id)?,
            Some(store) => self.resolve_bound(store.as_ref(), &snapshot, tenant_id).await?,
        };

        debug!(device = %device.name, "Tenant resolved");
        Ok(device)
    }

    async fn resolve_bound(
        &self,
        store: &dyn BindingStore,
        snapshot: &DeviceSnapshot,
        tenant_id: &TenantId,
    ) -> Result<Device, ResolveError> {
        // Fail before touching the store when there is nothing to bind to.
        let ring_choice = hashed(snapshot, tenant_id)?;

        if let Some(binding) = store.get(tenant_id).await? {
            if let Some(device) = snapshot.get(&binding.device_id) {
                return Ok(device.clone());
            }

            warn!(
                bound_device = %binding.device_id,
                device = %ring_choice.name,
                policy = ?self.stale_policy,
                "Bound device no longer registered, falling back to ring"
            );
            if self.stale_policy == StaleBindingPolicy::Rebind {
                store.replace(tenant_id, &ring_choice.name).await?;
                info!(device = %ring_choice.name, "Tenant rebound");
            }
            return Ok(ring_choice);
        }

        let binding = match store.insert_if_absent(tenant_id, &ring_choice.name).await {
            Ok(binding) => binding,
            Err(BindingStoreError::Conflict { .. }) => match store.get(tenant_id).await? {
                Some(binding) => binding,
                None => return Ok(ring_choice),
            },
            Err(e) => return Err(e.into()),
        };

        if binding.device_id != ring_choice.name {
            // A concurrent resolution against a different registry snapshot won.
            if let Some(device) = snapshot.get(&binding.device_id) {
                return Ok(device.clone());
            }
        } else {
            info!(device = %ring_choice.name, "Tenant bound");
        }
        Ok(ring_choice)
    }
}

fn hashed(snapshot: &DeviceSnapshot, tenant_id: &TenantId) -> Result<Device, ResolveError> {
    snapshot
        .locate(tenant_id)
        .cloned()
        .ok_or(ResolveError::NoDevicesConfigured)
}
