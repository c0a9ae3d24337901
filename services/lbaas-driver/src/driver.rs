//! Resource handlers.
//!
//! [`Driver`] is what the orchestration platform calls into. Every mutating
//! entry point follows the same shape: resolve the tenant's device, enter an
//! [`OperationContext`], run the appliance call and hooks inside it, and let
//! the context turn the outcome into a terminal status.

use std::sync::Arc;

use lbaas_id::TenantId;
use tracing::{error, instrument};

use crate::hooks::{LifecycleHooks, NoopHooks};
use crate::idempotency::Mutation;
use crate::inventory::LocalInventory;
use crate::operation::{OperationContext, OperationError, ReadContext};
use crate::registry::Device;
use crate::remote::ClientFactory;
use crate::resolver::{DeviceResolver, ResolveError};
use crate::resource::{ResourceKind, ResourceRef, ResourceSpec};
use crate::stats::{StatResult, StatsAggregator, StatsConfig, StatsError};
use crate::status::{Action, LoggingStatusReporter, OperationStatus, StatusReporter};

pub struct Driver {
    resolver: Arc<DeviceResolver>,
    clients: Arc<dyn ClientFactory>,
    reporter: Arc<dyn StatusReporter>,
    inventory: Option<Arc<dyn LocalInventory>>,
    hooks: Arc<dyn LifecycleHooks>,
    stats: StatsAggregator,
}

/// Builder for [`Driver`].
pub struct DriverBuilder {
    resolver: Arc<DeviceResolver>,
    clients: Arc<dyn ClientFactory>,
    reporter: Arc<dyn StatusReporter>,
    inventory: Option<Arc<dyn LocalInventory>>,
    hooks: Arc<dyn LifecycleHooks>,
    stats: StatsConfig,
}

impl DriverBuilder {
    pub fn reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Check updates and deletes against `inventory`.
    pub fn inventory(mut self, inventory: Arc<dyn LocalInventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn stats_config(mut self, config: StatsConfig) -> Self {
        self.stats = config;
        self
    }

    pub fn build(self) -> Driver {
        Driver {
            resolver: self.resolver,
            clients: self.clients,
            reporter: self.reporter,
            inventory: self.inventory,
            hooks: self.hooks,
            stats: StatsAggregator::new(self.stats),
        }
    }
}

impl Driver {
    /// Builder with logging status reports, no inventory and no-op hooks.
    pub fn builder(resolver: Arc<DeviceResolver>, clients: Arc<dyn ClientFactory>) -> DriverBuilder {
        DriverBuilder {
            resolver,
            clients,
            reporter: Arc::new(LoggingStatusReporter),
            inventory: None,
            hooks: Arc::new(NoopHooks),
            stats: StatsConfig::default(),
        }
    }

    pub fn resolver(&self) -> &DeviceResolver {
        &self.resolver
    }

    pub async fn resolve(&self, tenant_id: &TenantId) -> Result<Device, ResolveError> {
        self.resolver.resolve(tenant_id).await
    }

    /// Resolve the resource's device and open a status guard for `action`.
    ///
    /// A resolution failure is reported as `error` before returning, since
    /// no context exists yet to do it.
    pub async fn begin_operation(
        &self,
        resource: ResourceRef,
        action: Action,
    ) -> Result<OperationContext, OperationError> {
        if action.pending_status().is_none() {
            return Err(OperationError::NotMutating(action));
        }

        let device = match self.resolver.resolve(&resource.tenant_id).await {
            Ok(device) => device,
            Err(e) => {
                error!(resource = %resource, action = %action, error = %e, "Device resolution failed");
                self.reporter.report(&resource, OperationStatus::Error);
                return Err(e.into());
            }
        };

        let client = self.clients.client_for(&device);
        OperationContext::enter(
            resource,
            action,
            device,
            client,
            self.reporter.clone(),
            self.inventory.clone(),
        )
    }

    /// Resolve the resource's device for a non-mutating call.
    pub async fn begin_read(&self, resource: ResourceRef) -> Result<ReadContext, ResolveError> {
        let device = self.resolver.resolve(&resource.tenant_id).await?;
        let client = self.clients.client_for(&device);
        Ok(ReadContext::new(resource, device, client))
    }

    #[instrument(skip_all, fields(resource = %spec.resource, tenant_id = %spec.resource.tenant_id))]
    pub async fn create(&self, spec: &ResourceSpec) -> Result<(), OperationError> {
        let ctx = self.begin_operation(spec.resource.clone(), Action::Create).await?;

        let result = async {
            if ctx.resource().kind == ResourceKind::LoadBalancer {
                let device = ctx.device();
                self.hooks.partition_create(device, &device.shared_partition).await?;
            }
            Mutation::Create(spec).execute(ctx.client()).await?;
            self.hooks.after_create(ctx.device(), ctx.resource()).await?;
            Ok::<_, OperationError>(())
        }
        .await;

        ctx.finish(result).await
    }

    #[instrument(skip_all, fields(resource = %spec.resource, tenant_id = %spec.resource.tenant_id))]
    pub async fn update(&self, spec: &ResourceSpec) -> Result<(), OperationError> {
        let ctx = self.begin_operation(spec.resource.clone(), Action::Update).await?;

        let result = async {
            self.ensure_known(ctx.resource()).await?;
            Mutation::Update(spec).execute(ctx.client()).await?;
            self.hooks.after_update(ctx.device(), ctx.resource()).await?;
            Ok::<_, OperationError>(())
        }
        .await;

        ctx.finish(result).await
    }

    #[instrument(skip_all, fields(resource = %resource, tenant_id = %resource.tenant_id))]
    pub async fn delete(&self, resource: &ResourceRef) -> Result<(), OperationError> {
        let ctx = self.begin_operation(resource.clone(), Action::Delete).await?;

        let result = async {
            self.ensure_known(ctx.resource()).await?;
            Mutation::Delete(resource).execute(ctx.client()).await?;
            self.hooks.after_delete(ctx.device(), ctx.resource()).await?;
            if ctx.resource().kind == ResourceKind::LoadBalancer {
                let device = ctx.device();
                self.hooks.partition_delete(device, &device.shared_partition).await?;
            }
            Ok::<_, OperationError>(())
        }
        .await;

        ctx.finish(result).await
    }

    /// Counters for `resource`.
    ///
    /// Load balancers on devices that expose per-port counters are collected
    /// port by port; everything else uses the aggregate endpoint.
    #[instrument(skip_all, fields(resource = %resource, tenant_id = %resource.tenant_id))]
    pub async fn stats(&self, resource: &ResourceRef) -> Result<StatResult, StatsError> {
        let read = self.begin_read(resource.clone()).await?;

        if resource.kind == ResourceKind::LoadBalancer && read.device().exposes_port_stats() {
            self.stats.collect_per_port(read.client(), read.resource()).await
        } else {
            self.stats
                .collect_aggregate(read.client().as_ref(), read.resource())
                .await
        }
    }

    /// Counters for the given sub-resources of `resource`, merged.
    #[instrument(skip_all, fields(resource = %resource, sub_resources = sub_resource_ids.len()))]
    pub async fn collect_stats(
        &self,
        resource: &ResourceRef,
        sub_resource_ids: &[String],
    ) -> Result<StatResult, StatsError> {
        let read = self.begin_read(resource.clone()).await?;
        self.stats
            .collect_sub_resources(read.client(), read.resource(), sub_resource_ids)
            .await
    }

    async fn ensure_known(&self, resource: &ResourceRef) -> Result<(), OperationError> {
        let Some(inventory) = &self.inventory else {
            return Ok(());
        };
        if inventory.contains(resource).await? {
            Ok(())
        } else {
            Err(OperationError::ResourceNotFound(resource.clone()))
        }
    }
}
