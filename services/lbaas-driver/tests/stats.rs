//! Stats collection: concurrent merge, empty responses and failure policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lbaas_driver::registry::{Device, StaticRegistry};
use lbaas_driver::remote::{
    ApplianceClient, MockApplianceClient, MockClientFactory, RawStats, RemoteCall, RemoteError,
};
use lbaas_driver::resource::{ResourceKind, ResourceRef, ResourceSpec};
use lbaas_driver::stats::{counters, StatsAggregator, StatsError};
use lbaas_driver::status::RecordingStatusReporter;
use lbaas_driver::{DeviceResolver, Driver, StatsConfig, StatsFailurePolicy};
use lbaas_id::{DeviceId, ResourceId, TenantId};

fn lb() -> ResourceRef {
    ResourceRef::new(
        ResourceKind::LoadBalancer,
        ResourceId::parse("lb-1").unwrap(),
        TenantId::parse("tenant-a").unwrap(),
    )
}

fn bytes_in(value: u64) -> RawStats {
    RawStats::new()
        .with_counter(counters::BYTES_IN, value)
        .with_counter(counters::BYTES_OUT, value * 2)
        .with_counter(counters::TOTAL_CONNECTIONS, 1)
}

fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn ports_client() -> MockApplianceClient {
    let client = MockApplianceClient::new().with_latency(Duration::from_millis(3));
    client.add_sub_resource("80", Ok(bytes_in(10)));
    client.add_sub_resource("443", Ok(bytes_in(20)));
    client.add_sub_resource("8080", Ok(bytes_in(30)));
    client
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn merge_is_correct_under_concurrency() {
    let client: Arc<dyn ApplianceClient> = Arc::new(ports_client());
    let aggregator = StatsAggregator::default();

    for _ in 0..200 {
        let result = aggregator
            .collect_sub_resources(client.clone(), &lb(), &ids(&["80", "443", "8080"]))
            .await
            .unwrap();
        assert_eq!(result.bytes_in, 60);
        assert_eq!(result.bytes_out, 120);
        assert_eq!(result.total_connections, 3);
        assert_eq!(result.extended_stats["failed"], serde_json::json!([]));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_do_not_share_accumulators() {
    let client: Arc<dyn ApplianceClient> = Arc::new(ports_client());
    let aggregator = Arc::new(StatsAggregator::default());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let client = client.clone();
        let aggregator = aggregator.clone();
        handles.push(tokio::spawn(async move {
            aggregator
                .collect_sub_resources(client, &lb(), &ids(&["80", "443", "8080"]))
                .await
                .unwrap()
                .bytes_in
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), 60);
    }
}

#[tokio::test]
async fn no_sub_resources_is_all_zero() {
    let client: Arc<dyn ApplianceClient> = Arc::new(MockApplianceClient::new());
    let result = StatsAggregator::default()
        .collect_sub_resources(client, &lb(), &[])
        .await
        .unwrap();

    assert_eq!(result.bytes_in, 0);
    assert_eq!(result.active_connections, 0);
}

#[tokio::test]
async fn failed_fetch_counts_as_zero_by_default() {
    let client = ports_client();
    client.add_sub_resource("9000", Err(RemoteError::Other("timeout".into())));
    let client: Arc<dyn ApplianceClient> = Arc::new(client);

    let result = StatsAggregator::default()
        .collect_sub_resources(client, &lb(), &ids(&["80", "443", "8080", "9000"]))
        .await
        .unwrap();

    assert_eq!(result.bytes_in, 60);
    assert_eq!(result.extended_stats["failed"], serde_json::json!(["9000"]));
}

#[tokio::test]
async fn failed_fetch_aborts_when_configured() {
    let client = ports_client();
    client.add_sub_resource("9000", Err(RemoteError::Other("timeout".into())));
    let client: Arc<dyn ApplianceClient> = Arc::new(client);

    let aggregator = StatsAggregator::new(StatsConfig {
        on_failure: StatsFailurePolicy::Abort,
        max_concurrency: None,
    });
    let err = aggregator
        .collect_sub_resources(client, &lb(), &ids(&["80", "9000"]))
        .await
        .unwrap_err();

    assert!(matches!(err, StatsError::Remote { .. }));
}

#[tokio::test]
async fn repeated_ids_are_fetched_once() {
    let client = Arc::new(ports_client());
    let result = StatsAggregator::default()
        .collect_sub_resources(client.clone(), &lb(), &ids(&["80", "80"]))
        .await
        .unwrap();

    assert_eq!(result.bytes_in, 10);
    assert_eq!(result.extended_stats["sub_resources"].as_object().unwrap().len(), 1);
    assert_eq!(client.count(RemoteCall::SubResourceStats), 1);
}

/// Delegates to a mock appliance but panics when asked for one port.
struct PanicsOnPort {
    inner: MockApplianceClient,
    port: &'static str,
}

#[async_trait]
impl ApplianceClient for PanicsOnPort {
    async fn create(&self, spec: &ResourceSpec) -> Result<(), RemoteError> {
        self.inner.create(spec).await
    }

    async fn update(&self, spec: &ResourceSpec) -> Result<(), RemoteError> {
        self.inner.update(spec).await
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), RemoteError> {
        self.inner.delete(resource).await
    }

    async fn stats(&self, resource: &ResourceRef) -> Result<RawStats, RemoteError> {
        self.inner.stats(resource).await
    }

    async fn list_sub_resources(&self, resource: &ResourceRef) -> Result<Vec<String>, RemoteError> {
        self.inner.list_sub_resources(resource).await
    }

    async fn sub_resource_stats(
        &self,
        resource: &ResourceRef,
        sub_resource_id: &str,
    ) -> Result<RawStats, RemoteError> {
        if sub_resource_id == self.port {
            panic!("decoder bug on port {sub_resource_id}");
        }
        self.inner.sub_resource_stats(resource, sub_resource_id).await
    }
}

fn panics_on_443() -> Arc<dyn ApplianceClient> {
    Arc::new(PanicsOnPort {
        inner: ports_client(),
        port: "443",
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_fetch_counts_as_zero_by_default() {
    let result = StatsAggregator::default()
        .collect_sub_resources(panics_on_443(), &lb(), &ids(&["80", "443", "8080"]))
        .await
        .unwrap();

    assert_eq!(result.bytes_in, 40);
    assert_eq!(result.extended_stats["failed"], serde_json::json!(["443"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_fetch_aborts_when_configured() {
    let aggregator = StatsAggregator::new(StatsConfig {
        on_failure: StatsFailurePolicy::Abort,
        max_concurrency: None,
    });
    let err = aggregator
        .collect_sub_resources(panics_on_443(), &lb(), &ids(&["80", "443", "8080"]))
        .await
        .unwrap_err();

    let StatsError::Task { resource, .. } = &err else {
        panic!("unexpected error: {err:?}");
    };
    assert!(resource.ends_with(":443"), "{resource}");
}

/// Tracks the highest number of in-flight sub-resource fetches.
#[derive(Default)]
struct ConcurrencyGauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ApplianceClient for ConcurrencyGauge {
    async fn create(&self, _spec: &ResourceSpec) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn update(&self, _spec: &ResourceSpec) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn delete(&self, _resource: &ResourceRef) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn stats(&self, _resource: &ResourceRef) -> Result<RawStats, RemoteError> {
        Ok(RawStats::new())
    }

    async fn list_sub_resources(&self, _resource: &ResourceRef) -> Result<Vec<String>, RemoteError> {
        Ok(Vec::new())
    }

    async fn sub_resource_stats(
        &self,
        _resource: &ResourceRef,
        _sub_resource_id: &str,
    ) -> Result<RawStats, RemoteError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(bytes_in(1))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn semaphore_caps_fan_out() {
    let gauge = Arc::new(ConcurrencyGauge::default());
    let aggregator = StatsAggregator::new(StatsConfig {
        on_failure: StatsFailurePolicy::Zero,
        max_concurrency: Some(2),
    });
    let ports: Vec<String> = (0..12).map(|p| p.to_string()).collect();

    let result = aggregator
        .collect_sub_resources(gauge.clone(), &lb(), &ports)
        .await
        .unwrap();

    assert_eq!(result.bytes_in, 12);
    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
}

fn driver_for(device: Device, clients: Arc<MockClientFactory>) -> Driver {
    let registry = Arc::new(StaticRegistry::new([device], 160));
    Driver::builder(Arc::new(DeviceResolver::hash_only(registry)), clients)
        .reporter(Arc::new(RecordingStatusReporter::new()))
        .build()
}

#[tokio::test]
async fn driver_uses_per_port_stats_on_v3_devices() {
    let name = DeviceId::parse("ax-1").unwrap();
    let clients = Arc::new(MockClientFactory::new());
    let client = clients.insert(name.clone(), ports_client());
    let driver = driver_for(Device::new(name, "10.0.0.1"), clients);

    let result = driver.stats(&lb()).await.unwrap();

    assert_eq!(result.bytes_in, 60);
    assert_eq!(client.count(RemoteCall::ListSubResources), 1);
    assert_eq!(client.count(RemoteCall::Stats), 0);
}

#[tokio::test]
async fn driver_uses_aggregate_stats_on_older_devices() {
    let name = DeviceId::parse("ax-1").unwrap();
    let clients = Arc::new(MockClientFactory::new());
    let client = clients.insert(name.clone(), MockApplianceClient::new());
    client.set_stats(bytes_in(7));
    let driver = driver_for(Device::new(name, "10.0.0.1").with_api_version("2.1"), clients);

    let result = driver.stats(&lb()).await.unwrap();

    assert_eq!(result.bytes_in, 7);
    assert_eq!(client.count(RemoteCall::SubResourceStats), 0);
}

#[tokio::test]
async fn empty_aggregate_response_is_all_zero() {
    let name = DeviceId::parse("ax-1").unwrap();
    let clients = Arc::new(MockClientFactory::new());
    clients.insert(name.clone(), MockApplianceClient::new());
    let driver = driver_for(Device::new(name, "10.0.0.1").with_api_version("2.1"), clients);

    let result = driver.stats(&lb()).await.unwrap();

    assert_eq!(result.bytes_in, 0);
    assert_eq!(result.total_connections, 0);
}

#[tokio::test]
async fn stats_never_report_status() {
    let name = DeviceId::parse("ax-1").unwrap();
    let clients = Arc::new(MockClientFactory::new());
    let client = clients.insert(name.clone(), MockApplianceClient::new());
    client.fail_next(RemoteCall::Stats, RemoteError::Other("down".into()));
    let reporter = Arc::new(RecordingStatusReporter::new());
    let registry = Arc::new(StaticRegistry::new(
        [Device::new(name, "10.0.0.1").with_api_version("2.1")],
        160,
    ));
    let driver = Driver::builder(Arc::new(DeviceResolver::hash_only(registry)), clients)
        .reporter(reporter.clone())
        .build();

    let result = driver.stats(&lb()).await.unwrap();

    assert_eq!(result.bytes_in, 0);
    assert!(reporter.updates().is_empty());
}

#[tokio::test]
async fn collect_stats_merges_listed_ids() {
    let name = DeviceId::parse("ax-1").unwrap();
    let clients = Arc::new(MockClientFactory::new());
    clients.insert(name.clone(), ports_client());
    let driver = driver_for(Device::new(name, "10.0.0.1"), clients);

    let result = driver
        .collect_stats(&lb(), &ids(&["80", "8080"]))
        .await
        .unwrap();

    assert_eq!(result.bytes_in, 40);
}
