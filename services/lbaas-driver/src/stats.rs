//! Statistics collection.
//!
//! Appliances either expose one aggregate counter set per resource or one
//! counter set per sub-resource (listener port). For the latter the
//! aggregator fans out one task per sub-resource and merges each response
//! into an accumulator owned by that call. The accumulator lock is held for
//! a single merge only, never across a remote call.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, warn};

use crate::remote::{ApplianceClient, RawStats, RemoteError};
use crate::resolver::ResolveError;
use crate::resource::ResourceRef;

/// Appliance counter names.
pub mod counters {
    pub const BYTES_IN: &str = "req_bytes";
    pub const BYTES_OUT: &str = "resp_bytes";
    pub const ACTIVE_CONNECTIONS: &str = "cur_conns";
    pub const TOTAL_CONNECTIONS: &str = "tot_conns";
}

/// Merged counters for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatResult {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub extended_stats: Value,
}

impl StatResult {
    pub fn zero() -> Self {
        Self {
            bytes_in: 0,
            bytes_out: 0,
            active_connections: 0,
            total_connections: 0,
            extended_stats: Value::Object(Map::new()),
        }
    }

    fn from_counters(counters: &BTreeMap<String, u64>, extended_stats: Value) -> Self {
        let get = |name: &str| counters.get(name).copied().unwrap_or(0);
        Self {
            bytes_in: get(counters::BYTES_IN),
            bytes_out: get(counters::BYTES_OUT),
            active_connections: get(counters::ACTIVE_CONNECTIONS),
            total_connections: get(counters::TOTAL_CONNECTIONS),
            extended_stats,
        }
    }
}

/// What a failed stats fetch does to the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsFailurePolicy {
    /// Count the failed fetch as zero and keep going.
    #[default]
    Zero,
    /// Fail the whole call.
    Abort,
}

impl FromStr for StatsFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zero" => Ok(Self::Zero),
            "abort" => Ok(Self::Abort),
            other => Err(format!("unknown stats failure policy '{other}' (expected zero or abort)")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsConfig {
    pub on_failure: StatsFailurePolicy,

    /// Cap on concurrent sub-resource fetches within one call.
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("stats fetch failed for {resource}: {source}")]
    Remote {
        resource: String,
        #[source]
        source: RemoteError,
    },

    #[error("stats task for {resource} failed: {message}")]
    Task { resource: String, message: String },
}

impl StatsError {
    fn remote(resource: String, source: RemoteError) -> Self {
        Self::Remote { resource, source }
    }
}

#[derive(Debug, Default)]
struct StatAccumulator {
    counters: BTreeMap<String, u64>,
    per_sub_resource: Map<String, Value>,
    failed: Vec<String>,
}

impl StatAccumulator {
    fn merge(&mut self, sub_resource_id: &str, raw: RawStats) {
        for (name, value) in &raw.counters {
            let slot = self.counters.entry(name.clone()).or_insert(0);
            *slot = slot.saturating_add(*value);
        }

        let counters: Map<String, Value> = raw
            .counters
            .into_iter()
            .map(|(name, value)| (name, Value::from(value)))
            .collect();
        self.per_sub_resource
            .insert(sub_resource_id.to_owned(), Value::Object(counters));
    }

    fn into_result(mut self) -> StatResult {
        self.failed.sort();
        let extended = serde_json::json!({
            "sub_resources": Value::Object(self.per_sub_resource),
            "failed": self.failed,
        });
        StatResult::from_counters(&self.counters, extended)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fetches and merges counters.
#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    config: StatsConfig,
}

impl StatsAggregator {
    pub fn new(config: StatsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// One call against the aggregate endpoint. An empty response is all
    /// zeros.
    pub async fn collect_aggregate(
        &self,
        client: &dyn ApplianceClient,
        resource: &ResourceRef,
    ) -> Result<StatResult, StatsError> {
        match client.stats(resource).await {
            Ok(raw) if raw.is_empty() => {
                debug!(resource = %resource, "Appliance reported no counters");
                Ok(StatResult::zero())
            }
            Ok(raw) => Ok(StatResult::from_counters(&raw.counters, raw.extended)),
            Err(e) => self
                .on_failure(StatsError::remote(resource.to_string(), e))
                .map(|()| StatResult::zero()),
        }
    }

    /// List the resource's ports and collect each one.
    pub async fn collect_per_port(
        &self,
        client: Arc<dyn ApplianceClient>,
        resource: &ResourceRef,
    ) -> Result<StatResult, StatsError> {
        let ports = match client.list_sub_resources(resource).await {
            Ok(ports) => ports,
            Err(e) => {
                self.on_failure(StatsError::remote(resource.to_string(), e))?;
                return Ok(StatResult::zero());
            }
        };
        self.collect_sub_resources(client, resource, &ports).await
    }

    /// One concurrent fetch per distinct id in `sub_resource_ids`, merged.
    ///
    /// No ids means all zeros. A fetch that errors or panics is handled by
    /// the failure policy like any other failed sub-resource.
    pub async fn collect_sub_resources(
        &self,
        client: Arc<dyn ApplianceClient>,
        resource: &ResourceRef,
        sub_resource_ids: &[String],
    ) -> Result<StatResult, StatsError> {
        let sub_resource_ids: BTreeSet<&str> =
            sub_resource_ids.iter().map(String::as_str).collect();
        if sub_resource_ids.is_empty() {
            return Ok(StatResult::zero());
        }

        let accumulator = Arc::new(Mutex::new(StatAccumulator::default()));
        let semaphore = self
            .config
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut tasks = JoinSet::new();
        let mut spawned: HashMap<task::Id, String> = HashMap::new();
        for &id in &sub_resource_ids {
            let client = client.clone();
            let resource = resource.clone();
            let accumulator = accumulator.clone();
            let semaphore = semaphore.clone();
            let owned = id.to_owned();

            let handle = tasks.spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };

                let raw = client.sub_resource_stats(&resource, &owned).await?;
                lock(&accumulator).merge(&owned, raw);
                Ok::<(), RemoteError>(())
            });
            spawned.insert(handle.id(), id.to_owned());
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, error) = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((task_id, Err(e))) => {
                    let id = spawned.remove(&task_id).unwrap_or_default();
                    let error = StatsError::remote(format!("{resource}:{id}"), e);
                    (id, error)
                }
                Err(e) => {
                    let id = spawned.remove(&e.id()).unwrap_or_default();
                    let error = StatsError::Task {
                        resource: format!("{resource}:{id}"),
                        message: e.to_string(),
                    };
                    (id, error)
                }
            };
            if let Err(abort) = self.on_failure(error) {
                tasks.abort_all();
                return Err(abort);
            }
            lock(&accumulator).failed.push(id);
        }

        let merged = std::mem::take(&mut *lock(&accumulator));
        debug!(
            resource = %resource,
            sub_resources = sub_resource_ids.len(),
            failed = merged.failed.len(),
            "Stats merged"
        );
        Ok(merged.into_result())
    }

    fn on_failure(&self, error: StatsError) -> Result<(), StatsError> {
        match self.config.on_failure {
            StatsFailurePolicy::Zero => {
                warn!(error = %error, "Stats fetch failed, counting as zero");
                Ok(())
            }
            StatsFailurePolicy::Abort => Err(error),
        }
    }
}
