//! Idempotency policy for appliance mutations.
//!
//! The orchestration platform retries at least once, so some remote failures
//! mean the appliance is already in the requested state. The policy is a
//! fixed table from (action, remote outcome) to a [`Disposition`]:
//!
//! | action | outcome        | disposition |
//! |--------|----------------|-------------|
//! | create | already exists | absorb      |
//! | delete | not found      | absorb      |
//! | update | not found      | recover     |
//! | any    | anything else  | propagate   |
//!
//! Recovery runs the create path once. Its own failures never go back
//! through the table, except that a duplicate on the recovery create is
//! still a success.

use tracing::{info, warn};

use crate::operation::OperationError;
use crate::remote::{ApplianceClient, RemoteError, RemoteOutcome};
use crate::resource::{ResourceRef, ResourceSpec};
use crate::status::Action;

/// What to do with a failed appliance call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Treat as success.
    Absorb,
    /// Create the missing object, then treat as success.
    Recover,
    /// Hand the error to the caller.
    Propagate,
}

/// The (action, outcome) table.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdempotencyPolicy;

impl IdempotencyPolicy {
    pub fn disposition(action: Action, outcome: RemoteOutcome) -> Disposition {
        match (action, outcome) {
            (Action::Create, RemoteOutcome::AlreadyExists) => Disposition::Absorb,
            (Action::Delete, RemoteOutcome::NotFound) => Disposition::Absorb,
            (Action::Update, RemoteOutcome::NotFound) => Disposition::Recover,
            _ => Disposition::Propagate,
        }
    }

    /// Disposition of an operation error. Only remote outcomes are ever
    /// absorbed or recovered.
    pub fn classify(action: Action, error: &OperationError) -> Disposition {
        match error {
            OperationError::Remote(remote) => Self::disposition(action, remote.outcome()),
            _ => Disposition::Propagate,
        }
    }
}

/// A mutating appliance call.
#[derive(Debug, Clone, Copy)]
pub enum Mutation<'a> {
    Create(&'a ResourceSpec),
    Update(&'a ResourceSpec),
    Delete(&'a ResourceRef),
}

impl<'a> Mutation<'a> {
    pub fn action(&self) -> Action {
        match self {
            Self::Create(_) => Action::Create,
            Self::Update(_) => Action::Update,
            Self::Delete(_) => Action::Delete,
        }
    }

    pub fn resource(&self) -> &'a ResourceRef {
        match self {
            Self::Create(spec) | Self::Update(spec) => &spec.resource,
            Self::Delete(resource) => resource,
        }
    }

    /// Run the call and apply the policy to its outcome.
    ///
    /// Absorbed failures and successful recoveries return `Ok`. A failed
    /// recovery returns [`OperationError::RecoveryFailed`] carrying both the
    /// original and the recovery error.
    pub async fn execute(self, client: &dyn ApplianceClient) -> Result<(), OperationError> {
        let result = match self {
            Self::Create(spec) => client.create(spec).await,
            Self::Update(spec) => client.update(spec).await,
            Self::Delete(resource) => client.delete(resource).await,
        };

        let Err(error) = result else {
            return Ok(());
        };

        let action = self.action();
        match IdempotencyPolicy::disposition(action, error.outcome()) {
            Disposition::Absorb => {
                info!(
                    resource = %self.resource(),
                    action = %action,
                    error = %error,
                    "Benign appliance error absorbed"
                );
                Ok(())
            }
            Disposition::Recover => match self {
                Self::Update(spec) => recover(client, spec, error).await,
                _ => Err(error.into()),
            },
            Disposition::Propagate => Err(error.into()),
        }
    }
}

async fn recover(
    client: &dyn ApplianceClient,
    spec: &ResourceSpec,
    original: RemoteError,
) -> Result<(), OperationError> {
    warn!(
        resource = %spec.resource,
        error = %original,
        "Object missing on appliance during update, recreating"
    );

    match client.create(spec).await {
        Ok(()) => Ok(()),
        Err(RemoteError::AlreadyExists(_)) => Ok(()),
        Err(recovery) => Err(OperationError::RecoveryFailed { original, recovery }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MockApplianceClient, RemoteCall};
    use crate::resource::ResourceKind;
    use lbaas_id::{ResourceId, TenantId};
    use rstest::rstest;

    fn spec() -> ResourceSpec {
        ResourceSpec::new(ResourceRef::new(
            ResourceKind::Listener,
            ResourceId::parse("l-1").unwrap(),
            TenantId::parse("t1").unwrap(),
        ))
    }

    #[rstest]
    #[case(Action::Create, RemoteOutcome::AlreadyExists, Disposition::Absorb)]
    #[case(Action::Create, RemoteOutcome::NotFound, Disposition::Propagate)]
    #[case(Action::Create, RemoteOutcome::Other, Disposition::Propagate)]
    #[case(Action::Update, RemoteOutcome::NotFound, Disposition::Recover)]
    #[case(Action::Update, RemoteOutcome::AlreadyExists, Disposition::Propagate)]
    #[case(Action::Update, RemoteOutcome::Other, Disposition::Propagate)]
    #[case(Action::Delete, RemoteOutcome::NotFound, Disposition::Absorb)]
    #[case(Action::Delete, RemoteOutcome::AlreadyExists, Disposition::Propagate)]
    #[case(Action::Delete, RemoteOutcome::Other, Disposition::Propagate)]
    #[case(Action::Read, RemoteOutcome::NotFound, Disposition::Propagate)]
    fn test_disposition_table(
        #[case] action: Action,
        #[case] outcome: RemoteOutcome,
        #[case] expected: Disposition,
    ) {
        assert_eq!(IdempotencyPolicy::disposition(action, outcome), expected);
    }

    #[test]
    fn test_non_remote_errors_propagate() {
        let err = OperationError::ResourceNotFound(spec().resource);
        assert_eq!(
            IdempotencyPolicy::classify(Action::Delete, &err),
            Disposition::Propagate
        );
    }

    #[tokio::test]
    async fn test_update_not_found_recreates_once() {
        let client = MockApplianceClient::new();
        client.fail_next(RemoteCall::Update, RemoteError::NotFound("l-1".into()));

        let spec = spec();
        Mutation::Update(&spec).execute(&client).await.unwrap();

        assert_eq!(client.count(RemoteCall::Update), 1);
        assert_eq!(client.count(RemoteCall::Create), 1);
    }

    #[tokio::test]
    async fn test_recovery_duplicate_is_success() {
        let client = MockApplianceClient::new();
        client.fail_next(RemoteCall::Update, RemoteError::NotFound("l-1".into()));
        client.fail_next(RemoteCall::Create, RemoteError::AlreadyExists("l-1".into()));

        let spec = spec();
        assert!(Mutation::Update(&spec).execute(&client).await.is_ok());
    }

    #[tokio::test]
    async fn test_recovery_failure_keeps_original_error() {
        let client = MockApplianceClient::new();
        client.fail_next(RemoteCall::Update, RemoteError::NotFound("l-1".into()));
        client.fail_next(RemoteCall::Create, RemoteError::Other("quota".into()));

        let spec = spec();
        let err = Mutation::Update(&spec).execute(&client).await.unwrap_err();

        match err {
            OperationError::RecoveryFailed { original, recovery } => {
                assert_eq!(original, RemoteError::NotFound("l-1".into()));
                assert_eq!(recovery, RemoteError::Other("quota".into()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(client.count(RemoteCall::Create), 1);
    }

    #[tokio::test]
    async fn test_create_not_found_is_not_recovered() {
        let client = MockApplianceClient::new();
        client.fail_next(RemoteCall::Create, RemoteError::NotFound("l-1".into()));

        let spec = spec();
        let err = Mutation::Create(&spec).execute(&client).await.unwrap_err();

        assert!(matches!(err, OperationError::Remote(RemoteError::NotFound(_))));
        assert_eq!(client.count(RemoteCall::Create), 1);
    }
}
