//! Device registry.
//!
//! The registry maps device names to connection parameters. Resolution reads
//! it through a [`DeviceSnapshot`], which pairs the ordered device map with
//! the hash ring built from it, so a resolution never sees a ring that
//! disagrees with the device set.
//!
//! [`StaticRegistry`] loads devices from a TOML or JSON file:
//!
//! ```toml
//! [devices.ax-1]
//! host = "10.0.0.10"
//! username = "admin"
//! password = "secret"
//! api_version = "3.0"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use lbaas_id::{DeviceId, TenantId};
use lbaas_ring::HashRing;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors loading the device registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML registry: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid JSON registry: {0}")]
    Json(#[from] serde_json::Error),

    #[error("registry was not loaded from a file")]
    NoSource,
}

/// A load-balancing appliance.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub name: DeviceId,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub api_version: String,
    pub shared_partition: String,
    pub use_float: bool,
    pub autosnat: bool,
    pub v_method: String,
    pub default_virtual_server_vrid: Option<u32>,
    pub ipinip: bool,
    pub write_memory: bool,
    pub config: BTreeMap<String, String>,
}

impl Device {
    /// A device with default settings (https, API 3.0, shared partition).
    pub fn new(name: DeviceId, host: impl Into<String>) -> Self {
        Self {
            name,
            host: host.into(),
            port: 443,
            protocol: "https".to_string(),
            username: String::new(),
            password: String::new(),
            api_version: "3.0".to_string(),
            shared_partition: "shared".to_string(),
            use_float: false,
            autosnat: false,
            v_method: "LSI".to_string(),
            default_virtual_server_vrid: None,
            ipinip: false,
            write_memory: false,
            config: BTreeMap::new(),
        }
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Returns true if the appliance reports counters per listener port
    /// rather than through a single aggregate endpoint.
    pub fn exposes_port_stats(&self) -> bool {
        self.api_version.starts_with('3')
    }

    /// Base URL of the appliance's management API.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("api_version", &self.api_version)
            .field("shared_partition", &self.shared_partition)
            .finish_non_exhaustive()
    }
}

/// Device entry as written in a registry file; the name comes from the key.
#[derive(Debug, Deserialize)]
struct DeviceEntry {
    host: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default = "default_protocol")]
    protocol: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default = "default_api_version")]
    api_version: String,
    #[serde(default = "default_partition")]
    shared_partition: String,
    #[serde(default)]
    use_float: bool,
    #[serde(default)]
    autosnat: bool,
    #[serde(default = "default_v_method")]
    v_method: String,
    #[serde(default)]
    default_virtual_server_vrid: Option<u32>,
    #[serde(default)]
    ipinip: bool,
    #[serde(default)]
    write_memory: bool,
    #[serde(default)]
    config: BTreeMap<String, String>,
}

fn default_protocol() -> String {
    "https".to_string()
}

fn default_api_version() -> String {
    "3.0".to_string()
}

fn default_partition() -> String {
    "shared".to_string()
}

fn default_v_method() -> String {
    "LSI".to_string()
}

impl DeviceEntry {
    fn into_device(self, name: DeviceId) -> Device {
        let port = self
            .port
            .unwrap_or(if self.protocol == "http" { 80 } else { 443 });
        Device {
            name,
            host: self.host,
            port,
            protocol: self.protocol,
            username: self.username,
            password: self.password,
            api_version: self.api_version,
            shared_partition: self.shared_partition,
            use_float: self.use_float,
            autosnat: self.autosnat,
            v_method: self.v_method,
            default_virtual_server_vrid: self.default_virtual_server_vrid,
            ipinip: self.ipinip,
            write_memory: self.write_memory,
            config: self.config,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    devices: BTreeMap<DeviceId, DeviceEntry>,
}

impl RegistryFile {
    fn into_devices(self) -> Vec<Device> {
        self.devices
            .into_iter()
            .map(|(name, entry)| entry.into_device(name))
            .collect()
    }
}

/// Parse a TOML registry document.
pub fn parse_toml(contents: &str) -> Result<Vec<Device>, RegistryError> {
    let file: RegistryFile = toml::from_str(contents)?;
    Ok(file.into_devices())
}

/// Parse a JSON registry document.
pub fn parse_json(contents: &str) -> Result<Vec<Device>, RegistryError> {
    let file: RegistryFile = serde_json::from_str(contents)?;
    Ok(file.into_devices())
}

/// Load a registry file; `.json` files are parsed as JSON, anything else as TOML.
pub fn load_file(path: &Path) -> Result<Vec<Device>, RegistryError> {
    let contents = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_json(&contents),
        _ => parse_toml(&contents),
    }
}

/// Immutable view of the registry and the ring derived from it.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    devices: BTreeMap<DeviceId, Device>,
    ring: HashRing,
}

impl DeviceSnapshot {
    /// Build a snapshot. Later duplicates of a name replace earlier ones.
    pub fn new(devices: impl IntoIterator<Item = Device>, replicas: u32) -> Self {
        let devices: BTreeMap<DeviceId, Device> =
            devices.into_iter().map(|d| (d.name.clone(), d)).collect();
        let ring = HashRing::with_replicas(devices.keys().map(DeviceId::as_str), replicas);
        Self { devices, ring }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), lbaas_ring::DEFAULT_REPLICAS)
    }

    pub fn get(&self, name: &DeviceId) -> Option<&Device> {
        self.devices.get(name)
    }

    /// Devices ordered by name.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    /// The device owning `tenant_id`'s ring segment.
    pub fn locate(&self, tenant_id: &TenantId) -> Option<&Device> {
        let owner = self.ring.lookup(tenant_id.as_str())?;
        self.devices.get(owner)
    }
}

/// Read-only source of devices.
pub trait DeviceRegistry: Send + Sync {
    /// Current snapshot; stable for as long as the caller holds it.
    fn snapshot(&self) -> Arc<DeviceSnapshot>;
}

/// Registry held in memory, optionally backed by a file.
///
/// Uses ArcSwap so readers never block while a reload swaps in a new
/// snapshot.
pub struct StaticRegistry {
    snapshot: ArcSwap<DeviceSnapshot>,
    source: Option<PathBuf>,
    replicas: u32,
}

impl StaticRegistry {
    pub fn new(devices: impl IntoIterator<Item = Device>, replicas: u32) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(DeviceSnapshot::new(devices, replicas)),
            source: None,
            replicas,
        }
    }

    /// Load the registry from a file, remembering the path for [`Self::reload`].
    pub fn from_file(path: impl Into<PathBuf>, replicas: u32) -> Result<Self, RegistryError> {
        let path = path.into();
        let devices = load_file(&path)?;
        let registry = Self {
            snapshot: ArcSwap::from_pointee(DeviceSnapshot::new(devices, replicas)),
            source: Some(path),
            replicas,
        };
        registry.log_loaded();
        Ok(registry)
    }

    /// Atomically replace the device set.
    pub fn replace(&self, devices: impl IntoIterator<Item = Device>) {
        self.snapshot
            .store(Arc::new(DeviceSnapshot::new(devices, self.replicas)));
        self.log_loaded();
    }

    /// Re-read the source file. Returns the new device count.
    pub fn reload(&self) -> Result<usize, RegistryError> {
        let path = self.source.as_ref().ok_or(RegistryError::NoSource)?;
        let devices = load_file(path)?;
        self.replace(devices);
        Ok(self.snapshot.load().len())
    }

    fn log_loaded(&self) {
        let snapshot = self.snapshot.load();
        info!(
            device_count = snapshot.len(),
            ring_fingerprint = %snapshot.ring().fingerprint(),
            "Device registry loaded"
        );
    }
}

impl DeviceRegistry for StaticRegistry {
    fn snapshot(&self) -> Arc<DeviceSnapshot> {
        self.snapshot.load_full()
    }
}
