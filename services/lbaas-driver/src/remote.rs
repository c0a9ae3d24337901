//! Appliance client interface and mock implementation.
//!
//! The client abstracts every call this crate makes against an appliance:
//! - Creating, updating and deleting objects
//! - Fetching aggregate and per-sub-resource counters
//!
//! Every call either succeeds or fails with one of the closed set of
//! [`RemoteError`] outcomes. The idempotency policy works only from that
//! classification, so client implementations must map their transport's
//! "duplicate" and "missing" responses onto `AlreadyExists` and `NotFound`.
//!
//! A mock implementation is provided for testing and development.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lbaas_id::DeviceId;
use thiserror::Error;
use tracing::debug;

use crate::registry::Device;
use crate::resource::{ResourceRef, ResourceSpec};

/// Failure outcomes of an appliance call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The object already exists on the appliance.
    #[error("already exists on appliance: {0}")]
    AlreadyExists(String),

    /// The object does not exist on the appliance.
    #[error("not found on appliance: {0}")]
    NotFound(String),

    /// Any other appliance or transport failure.
    #[error("appliance error: {0}")]
    Other(String),
}

impl RemoteError {
    /// Classify this error for the idempotency policy.
    pub fn outcome(&self) -> RemoteOutcome {
        match self {
            Self::AlreadyExists(_) => RemoteOutcome::AlreadyExists,
            Self::NotFound(_) => RemoteOutcome::NotFound,
            Self::Other(_) => RemoteOutcome::Other,
        }
    }
}

/// Classification of a failed appliance call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOutcome {
    AlreadyExists,
    NotFound,
    Other,
}

/// Counters returned by a stats call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStats {
    /// Numeric counters by appliance counter name.
    pub counters: BTreeMap<String, u64>,

    /// Raw response, kept for diagnostics.
    pub extended: serde_json::Value,
}

impl RawStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counter(mut self, name: impl Into<String>, value: u64) -> Self {
        self.counters.insert(name.into(), value);
        self
    }

    pub fn with_extended(mut self, extended: serde_json::Value) -> Self {
        self.extended = extended;
        self
    }

    /// Returns true if the appliance reported nothing.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Client for one appliance.
#[async_trait]
pub trait ApplianceClient: Send + Sync {
    /// Create the object described by `spec`.
    async fn create(&self, spec: &ResourceSpec) -> Result<(), RemoteError>;

    /// Update the object described by `spec`.
    async fn update(&self, spec: &ResourceSpec) -> Result<(), RemoteError>;

    /// Delete the object for `resource`.
    async fn delete(&self, resource: &ResourceRef) -> Result<(), RemoteError>;

    /// Aggregate counters for `resource`.
    async fn stats(&self, resource: &ResourceRef) -> Result<RawStats, RemoteError>;

    /// Ids of the sub-resources (listener ports) that carry their own counters.
    async fn list_sub_resources(&self, resource: &ResourceRef) -> Result<Vec<String>, RemoteError>;

    /// Counters for one sub-resource of `resource`.
    async fn sub_resource_stats(
        &self,
        resource: &ResourceRef,
        sub_resource_id: &str,
    ) -> Result<RawStats, RemoteError>;
}

/// Produces a client bound to a particular device.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, device: &Device) -> Arc<dyn ApplianceClient>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kind of call recorded by [`MockApplianceClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCall {
    Create,
    Update,
    Delete,
    Stats,
    ListSubResources,
    SubResourceStats,
}

/// One call observed by [`MockApplianceClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub call: RemoteCall,
    pub resource: ResourceRef,
    pub sub_resource: Option<String>,
}

/// Mock appliance for testing and development.
///
/// Calls succeed unless a failure has been queued for that call kind with
/// [`MockApplianceClient::fail_next`]. Every call is journaled.
#[derive(Default)]
pub struct MockApplianceClient {
    failures: Mutex<HashMap<RemoteCall, VecDeque<RemoteError>>>,
    aggregate: Mutex<RawStats>,
    sub_resources: Mutex<BTreeMap<String, Result<RawStats, RemoteError>>>,
    journal: Mutex<Vec<CallRecord>>,
    latency: Option<Duration>,
}

impl MockApplianceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every stats call by up to `latency`, varying per sub-resource.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next call of kind `call` with `error`.
    pub fn fail_next(&self, call: RemoteCall, error: RemoteError) {
        lock(&self.failures).entry(call).or_default().push_back(error);
    }

    /// Set the response of the aggregate stats endpoint.
    pub fn set_stats(&self, stats: RawStats) {
        *lock(&self.aggregate) = stats;
    }

    /// Register a sub-resource and the outcome of fetching its counters.
    pub fn add_sub_resource(&self, id: impl Into<String>, outcome: Result<RawStats, RemoteError>) {
        lock(&self.sub_resources).insert(id.into(), outcome);
    }

    /// All calls observed so far, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.journal).clone()
    }

    /// Number of calls of kind `call` observed so far.
    pub fn count(&self, call: RemoteCall) -> usize {
        lock(&self.journal).iter().filter(|c| c.call == call).count()
    }

    fn record(
        &self,
        call: RemoteCall,
        resource: &ResourceRef,
        sub_resource: Option<&str>,
    ) -> Result<(), RemoteError> {
        lock(&self.journal).push(CallRecord {
            call,
            resource: resource.clone(),
            sub_resource: sub_resource.map(str::to_owned),
        });

        match lock(&self.failures).get_mut(&call).and_then(VecDeque::pop_front) {
            Some(error) => {
                debug!(?call, resource = %resource, error = %error, "[MOCK] Injected failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    async fn simulate_latency(&self, salt: &str) {
        let Some(latency) = self.latency else {
            return;
        };
        let spread = salt.bytes().map(u64::from).sum::<u64>() % 7 + 1;
        let max = latency.as_micros().max(1) as u64;
        tokio::time::sleep(Duration::from_micros(max * spread / 7)).await;
    }
}

#[async_trait]
impl ApplianceClient for MockApplianceClient {
    async fn create(&self, spec: &ResourceSpec) -> Result<(), RemoteError> {
        self.record(RemoteCall::Create, &spec.resource, None)?;
        debug!(resource = %spec.resource, name = %spec.name, "[MOCK] Created");
        Ok(())
    }

    async fn update(&self, spec: &ResourceSpec) -> Result<(), RemoteError> {
        self.record(RemoteCall::Update, &spec.resource, None)?;
        debug!(resource = %spec.resource, name = %spec.name, "[MOCK] Updated");
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), RemoteError> {
        self.record(RemoteCall::Delete, resource, None)?;
        debug!(resource = %resource, "[MOCK] Deleted");
        Ok(())
    }

    async fn stats(&self, resource: &ResourceRef) -> Result<RawStats, RemoteError> {
        self.record(RemoteCall::Stats, resource, None)?;
        self.simulate_latency(resource.id.as_str()).await;
        Ok(lock(&self.aggregate).clone())
    }

    async fn list_sub_resources(&self, resource: &ResourceRef) -> Result<Vec<String>, RemoteError> {
        self.record(RemoteCall::ListSubResources, resource, None)?;
        Ok(lock(&self.sub_resources).keys().cloned().collect())
    }

    async fn sub_resource_stats(
        &self,
        resource: &ResourceRef,
        sub_resource_id: &str,
    ) -> Result<RawStats, RemoteError> {
        self.record(RemoteCall::SubResourceStats, resource, Some(sub_resource_id))?;
        self.simulate_latency(sub_resource_id).await;
        lock(&self.sub_resources)
            .get(sub_resource_id)
            .cloned()
            .unwrap_or_else(|| Err(RemoteError::NotFound(sub_resource_id.to_owned())))
    }
}

/// Hands out one [`MockApplianceClient`] per device.
#[derive(Default)]
pub struct MockClientFactory {
    clients: Mutex<HashMap<DeviceId, Arc<MockApplianceClient>>>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mock for `device`, created on first use.
    pub fn client(&self, device: &DeviceId) -> Arc<MockApplianceClient> {
        lock(&self.clients)
            .entry(device.clone())
            .or_insert_with(|| Arc::new(MockApplianceClient::new()))
            .clone()
    }

    /// Install a preconfigured mock for `device`.
    pub fn insert(&self, device: DeviceId, client: MockApplianceClient) -> Arc<MockApplianceClient> {
        let client = Arc::new(client);
        lock(&self.clients).insert(device, client.clone());
        client
    }
}

impl ClientFactory for MockClientFactory {
    fn client_for(&self, device: &Device) -> Arc<dyn ApplianceClient> {
        self.client(&device.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;
    use lbaas_id::{ResourceId, TenantId};

    fn lb() -> ResourceRef {
        ResourceRef::new(
            ResourceKind::LoadBalancer,
            ResourceId::parse("lb-1").unwrap(),
            TenantId::parse("t1").unwrap(),
        )
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(
            RemoteError::AlreadyExists("x".into()).outcome(),
            RemoteOutcome::AlreadyExists
        );
        assert_eq!(RemoteError::NotFound("x".into()).outcome(), RemoteOutcome::NotFound);
        assert_eq!(RemoteError::Other("x".into()).outcome(), RemoteOutcome::Other);
    }

    #[tokio::test]
    async fn test_mock_failures_are_consumed_in_order() {
        let client = MockApplianceClient::new();
        client.fail_next(RemoteCall::Delete, RemoteError::NotFound("lb-1".into()));

        assert!(matches!(
            client.delete(&lb()).await,
            Err(RemoteError::NotFound(_))
        ));
        assert!(client.delete(&lb()).await.is_ok());
        assert_eq!(client.count(RemoteCall::Delete), 2);
    }

    #[tokio::test]
    async fn test_mock_unknown_sub_resource_is_not_found() {
        let client = MockApplianceClient::new();
        let err = client.sub_resource_stats(&lb(), "443").await.unwrap_err();
        assert_eq!(err, RemoteError::NotFound("443".into()));
    }

    #[test]
    fn test_factory_reuses_client_per_device() {
        let factory = MockClientFactory::new();
        let name = DeviceId::parse("ax-1").unwrap();
        let a = factory.client(&name);
        let b = factory.client(&name);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
