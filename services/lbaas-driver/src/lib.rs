//! Load-balancer appliance driver.
//!
//! Places tenants on a fixed pool of appliances and drives resource
//! lifecycle calls against them while keeping the orchestration platform's
//! view of each resource's status consistent. The `lbaas-driver` binary
//! serves health probes and placement lookups; the library surface is what
//! resource handlers embed.

pub mod api;
pub mod bindings;
pub mod config;
pub mod db;
pub mod driver;
pub mod hooks;
pub mod idempotency;
pub mod inventory;
pub mod operation;
pub mod registry;
pub mod remote;
pub mod resolver;
pub mod resource;
pub mod state;
pub mod stats;
pub mod status;

pub use driver::{Driver, DriverBuilder};
pub use operation::{OperationContext, OperationError, ReadContext};
pub use resolver::{DeviceResolver, PlacementMode, ResolveError, StaleBindingPolicy};
pub use stats::{StatResult, StatsConfig, StatsFailurePolicy};
pub use status::{Action, OperationStatus, StatusReporter};
