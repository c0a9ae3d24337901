//! Operation context: the status guard around every appliance mutation.
//!
//! Entering a context reports the action's `pending_*` status. Leaving it
//! reports exactly one terminal status:
//! - `active` / `deleted` after [`OperationContext::succeed`], or after
//!   [`OperationContext::fail_with`] with an error the idempotency policy
//!   absorbs
//! - `error` after `fail_with` with any other error
//! - `error` from `Drop` when the context is abandoned, which covers early
//!   returns, panics and cancelled futures
//!
//! Read calls use [`ReadContext`], which never reports status.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::hooks::HookError;
use crate::idempotency::{Disposition, IdempotencyPolicy, Mutation};
use crate::inventory::{InventoryError, LocalInventory};
use crate::registry::Device;
use crate::remote::{ApplianceClient, RemoteError};
use crate::resolver::ResolveError;
use crate::resource::ResourceRef;
use crate::status::{Action, OperationStatus, StatusReporter};

/// Errors surfaced by driver operations.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The local inventory has no record of the resource.
    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceRef),

    /// An update found the object missing and recreating it failed too.
    #[error("update failed with {original}, recreating the object failed with {recovery}")]
    RecoveryFailed {
        #[source]
        original: RemoteError,
        recovery: RemoteError,
    },

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error("lifecycle hook failed: {0}")]
    Hook(#[from] HookError),

    /// A mutating context was requested for a read.
    #[error("{0} is not a mutating action")]
    NotMutating(Action),

    /// The mutation does not match the action the context was opened for.
    #[error("{mutation} mutation run in a {context} context")]
    ActionMismatch { context: Action, mutation: Action },
}

/// Status guard for one mutating call.
///
/// Must be consumed by [`succeed`](Self::succeed),
/// [`fail_with`](Self::fail_with), [`finish`](Self::finish) or
/// [`run`](Self::run). Dropping it unfinished reports `error`.
pub struct OperationContext {
    resource: ResourceRef,
    action: Action,
    device: Device,
    client: Arc<dyn ApplianceClient>,
    reporter: Arc<dyn StatusReporter>,
    inventory: Option<Arc<dyn LocalInventory>>,
    status: OperationStatus,
    finished: bool,
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("resource", &self.resource)
            .field("action", &self.action)
            .field("device", &self.device.name)
            .field("status", &self.status)
            .field("finished", &self.finished)
            .finish()
    }
}

impl OperationContext {
    /// Open a context and report the pending status.
    pub fn enter(
        resource: ResourceRef,
        action: Action,
        device: Device,
        client: Arc<dyn ApplianceClient>,
        reporter: Arc<dyn StatusReporter>,
        inventory: Option<Arc<dyn LocalInventory>>,
    ) -> Result<Self, OperationError> {
        let status = action
            .pending_status()
            .ok_or(OperationError::NotMutating(action))?;

        reporter.report(&resource, status);
        debug!(
            resource = %resource,
            action = %action,
            device = %device.name,
            "Operation started"
        );

        Ok(Self {
            resource,
            action,
            device,
            client,
            reporter,
            inventory,
            status,
            finished: false,
        })
    }

    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn client(&self) -> &dyn ApplianceClient {
        self.client.as_ref()
    }

    /// Last status reported by this context.
    pub fn status(&self) -> OperationStatus {
        self.status
    }

    /// Run `mutation` against the device and close the context with its result.
    ///
    /// A mutation for a different action is not sent and ends in `error`.
    pub async fn run(self, mutation: Mutation<'_>) -> Result<(), OperationError> {
        if mutation.action() != self.action {
            let mismatch = OperationError::ActionMismatch {
                context: self.action,
                mutation: mutation.action(),
            };
            return self.fail_with(mismatch).await;
        }
        let result = mutation.execute(self.client.as_ref()).await;
        self.finish(result).await
    }

    /// Close the context with the outcome of the guarded work.
    pub async fn finish(self, result: Result<(), OperationError>) -> Result<(), OperationError> {
        match result {
            Ok(()) => self.succeed().await,
            Err(e) => self.fail_with(e).await,
        }
    }

    /// Close the context as successful.
    ///
    /// For deletes the local inventory row is removed first; if that fails
    /// the operation ends in `error` instead.
    pub async fn succeed(mut self) -> Result<(), OperationError> {
        if self.action == Action::Delete {
            if let Some(inventory) = &self.inventory {
                if let Err(e) = inventory.remove(&self.resource).await {
                    self.terminate(OperationStatus::Error);
                    return Err(e.into());
                }
            }
        }

        self.terminate(self.action.success_status());
        Ok(())
    }

    /// Close the context with an error.
    ///
    /// Errors the idempotency policy absorbs for this action end the
    /// operation successfully. Recovery needs the resource spec, so it only
    /// happens through [`run`](Self::run); here it propagates.
    pub async fn fail_with(mut self, error: OperationError) -> Result<(), OperationError> {
        if IdempotencyPolicy::classify(self.action, &error) == Disposition::Absorb {
            debug!(resource = %self.resource, error = %error, "Error absorbed on exit");
            return self.succeed().await;
        }

        warn!(
            resource = %self.resource,
            action = %self.action,
            device = %self.device.name,
            error = %error,
            "Operation failed"
        );
        self.terminate(OperationStatus::Error);
        Err(error)
    }

    fn terminate(&mut self, status: OperationStatus) {
        self.status = status;
        self.finished = true;
        self.reporter.report(&self.resource, status);
        debug!(resource = %self.resource, status = %status, "Operation finished");
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                resource = %self.resource,
                action = %self.action,
                "Operation abandoned without a result, reporting error"
            );
            self.terminate(OperationStatus::Error);
        }
    }
}

/// Context for non-mutating calls. Never reports status.
#[derive(Clone)]
pub struct ReadContext {
    resource: ResourceRef,
    device: Device,
    client: Arc<dyn ApplianceClient>,
}

impl ReadContext {
    pub fn new(resource: ResourceRef, device: Device, client: Arc<dyn ApplianceClient>) -> Self {
        Self {
            resource,
            device,
            client,
        }
    }

    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn client(&self) -> Arc<dyn ApplianceClient> {
        self.client.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::MemoryInventory;
    use crate::remote::{MockApplianceClient, RemoteCall};
    use crate::resource::{ResourceKind, ResourceSpec};
    use crate::status::RecordingStatusReporter;
    use lbaas_id::{DeviceId, ResourceId, TenantId};

    struct Fixture {
        client: Arc<MockApplianceClient>,
        reporter: Arc<RecordingStatusReporter>,
        inventory: Arc<MemoryInventory>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                client: Arc::new(MockApplianceClient::new()),
                reporter: Arc::new(RecordingStatusReporter::new()),
                inventory: Arc::new(MemoryInventory::new()),
            }
        }

        fn enter(&self, action: Action) -> Result<OperationContext, OperationError> {
            OperationContext::enter(
                member(),
                action,
                Device::new(DeviceId::parse("ax-1").unwrap(), "10.0.0.1"),
                self.client.clone(),
                self.reporter.clone(),
                Some(self.inventory.clone()),
            )
        }

        fn statuses(&self) -> Vec<OperationStatus> {
            self.reporter.statuses_for(&member())
        }
    }

    fn member() -> ResourceRef {
        ResourceRef::new(
            ResourceKind::Member,
            ResourceId::parse("m-1").unwrap(),
            TenantId::parse("t1").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_create_reports_pending_then_active() {
        let fx = Fixture::new();
        let ctx = fx.enter(Action::Create).unwrap();
        assert_eq!(ctx.status(), OperationStatus::PendingCreate);

        ctx.succeed().await.unwrap();
        assert_eq!(
            fx.statuses(),
            vec![OperationStatus::PendingCreate, OperationStatus::Active]
        );
    }

    #[tokio::test]
    async fn test_delete_success_removes_inventory_row() {
        let fx = Fixture::new();
        fx.inventory.insert(member());

        fx.enter(Action::Delete).unwrap().succeed().await.unwrap();

        assert!(fx.inventory.is_empty());
        assert_eq!(fx.reporter.last(&member()), Some(OperationStatus::Deleted));
    }

    #[tokio::test]
    async fn test_fail_with_absorbs_duplicate_create() {
        let fx = Fixture::new();
        let ctx = fx.enter(Action::Create).unwrap();

        ctx.fail_with(RemoteError::AlreadyExists("m-1".into()).into())
            .await
            .unwrap();

        assert_eq!(fx.reporter.last(&member()), Some(OperationStatus::Active));
    }

    #[tokio::test]
    async fn test_fail_with_propagates_other_errors() {
        let fx = Fixture::new();
        let ctx = fx.enter(Action::Update).unwrap();

        let err = ctx
            .fail_with(RemoteError::Other("timeout".into()).into())
            .await
            .unwrap_err();

        assert!(matches!(err, OperationError::Remote(RemoteError::Other(_))));
        assert_eq!(
            fx.statuses(),
            vec![OperationStatus::PendingUpdate, OperationStatus::Error]
        );
    }

    #[tokio::test]
    async fn test_drop_reports_error_once() {
        let fx = Fixture::new();
        drop(fx.enter(Action::Delete).unwrap());

        assert_eq!(
            fx.statuses(),
            vec![OperationStatus::PendingDelete, OperationStatus::Error]
        );
    }

    #[tokio::test]
    async fn test_run_applies_policy() {
        let fx = Fixture::new();
        fx.client
            .fail_next(RemoteCall::Delete, RemoteError::NotFound("m-1".into()));

        let ctx = fx.enter(Action::Delete).unwrap();
        ctx.run(Mutation::Delete(&member())).await.unwrap();

        assert_eq!(fx.reporter.last(&member()), Some(OperationStatus::Deleted));
    }

    #[tokio::test]
    async fn test_run_recovery_failure_reports_error() {
        let fx = Fixture::new();
        fx.client
            .fail_next(RemoteCall::Update, RemoteError::NotFound("m-1".into()));
        fx.client
            .fail_next(RemoteCall::Create, RemoteError::Other("boom".into()));

        let spec = ResourceSpec::new(member());
        let err = fx
            .enter(Action::Update)
            .unwrap()
            .run(Mutation::Update(&spec))
            .await
            .unwrap_err();

        assert!(matches!(err, OperationError::RecoveryFailed { .. }));
        assert_eq!(fx.reporter.last(&member()), Some(OperationStatus::Error));
    }

    #[tokio::test]
    async fn test_run_rejects_mutation_for_another_action() {
        let fx = Fixture::new();

        let err = fx
            .enter(Action::Delete)
            .unwrap()
            .run(Mutation::Create(&ResourceSpec::new(member())))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OperationError::ActionMismatch {
                context: Action::Delete,
                mutation: Action::Create,
            }
        ));
        assert_eq!(fx.client.count(RemoteCall::Create), 0);
        assert_eq!(
            fx.statuses(),
            vec![OperationStatus::PendingDelete, OperationStatus::Error]
        );
    }

    #[test]
    fn test_recovery_failure_message_leads_with_original_error() {
        let err = OperationError::RecoveryFailed {
            original: RemoteError::NotFound("m-1".into()),
            recovery: RemoteError::Other("partition full".into()),
        };
        let message = err.to_string();

        let original = RemoteError::NotFound("m-1".into()).to_string();
        assert!(message.starts_with(&format!("update failed with {original}")), "{message}");
        assert!(message.contains("partition full"), "{message}");
    }

    #[test]
    fn test_read_is_not_a_mutation() {
        let fx = Fixture::new();
        let err = fx.enter(Action::Read).unwrap_err();
        assert!(matches!(err, OperationError::NotMutating(Action::Read)));
        assert!(fx.statuses().is_empty());
    }
}
