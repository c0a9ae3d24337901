//! Deployment-specific hooks run around appliance mutations.
//!
//! Hooks run inside the operation context: a failing hook turns the
//! operation into an `error`. Load balancers additionally get partition
//! hooks: `partition_create` before the appliance create and
//! `partition_delete` after the appliance delete, both with the device's
//! shared partition.

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::Device;
use crate::resource::ResourceRef;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(pub String);

#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn after_create(&self, _device: &Device, _resource: &ResourceRef) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_update(&self, _device: &Device, _resource: &ResourceRef) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_delete(&self, _device: &Device, _resource: &ResourceRef) -> Result<(), HookError> {
        Ok(())
    }

    async fn partition_create(&self, _device: &Device, _partition: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn partition_delete(&self, _device: &Device, _partition: &str) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}
