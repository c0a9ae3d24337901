use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lbaas_ring::DEFAULT_REPLICAS;

use crate::db::DbConfig;
use crate::resolver::{PlacementMode, StaleBindingPolicy};
use crate::stats::{StatsConfig, StatsFailurePolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub devices_file: PathBuf,
    pub placement: PlacementMode,
    pub stale_binding: StaleBindingPolicy,
    pub stats: StatsConfig,
    pub ring_replicas: u32,
    pub registry_reload_interval: Option<Duration>,
    pub database: DbConfig,
}

fn flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn optional<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("invalid {name}: {e}")),
        _ => Ok(None),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("LBAAS_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:9876".to_string())
            .parse()
            .context("invalid LBAAS_LISTEN_ADDR")?;

        let log_level = std::env::var("LBAAS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = flag("LBAAS_DEV");

        let devices_file = std::env::var("LBAAS_DEVICES_FILE")
            .map(PathBuf::from)
            .context("LBAAS_DEVICES_FILE must point at the device registry")?;

        let placement = if flag("LBAAS_USE_DATABASE") {
            PlacementMode::HashWithBinding
        } else {
            PlacementMode::Hash
        };

        let stale_binding = optional::<StaleBindingPolicy>("LBAAS_STALE_BINDING")?.unwrap_or_default();

        let stats = StatsConfig {
            on_failure: optional::<StatsFailurePolicy>("LBAAS_STATS_ON_FAILURE")?.unwrap_or_default(),
            max_concurrency: optional("LBAAS_STATS_MAX_CONCURRENCY")?,
        };

        let ring_replicas = optional("LBAAS_RING_REPLICAS")?.unwrap_or(DEFAULT_REPLICAS);
        if ring_replicas == 0 {
            return Err(anyhow!("LBAAS_RING_REPLICAS must be at least 1"));
        }

        let registry_reload_interval = optional::<u64>("LBAAS_REGISTRY_RELOAD_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let database = DbConfig::from_env();

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            devices_file,
            placement,
            stale_binding,
            stats,
            ring_replicas,
            registry_reload_interval,
            database,
        })
    }

    pub fn uses_database(&self) -> bool {
        self.placement == PlacementMode::HashWithBinding
    }
}
