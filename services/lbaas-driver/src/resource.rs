//! References to load-balancing resources owned by the orchestration platform.

use std::fmt;

use lbaas_id::{ResourceId, TenantId};
use serde::{Deserialize, Serialize};

/// Kind of load-balancing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    LoadBalancer,
    Listener,
    Pool,
    Member,
    HealthMonitor,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadBalancer => "loadbalancer",
            Self::Listener => "listener",
            Self::Pool => "pool",
            Self::Member => "member",
            Self::HealthMonitor => "healthmonitor",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource as the platform knows it: kind, id and owning tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: ResourceId,
    pub tenant_id: TenantId,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: ResourceId, tenant_id: TenantId) -> Self {
        Self {
            kind,
            id,
            tenant_id,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Desired appliance-side state for a create or update.
///
/// `body` is already in the appliance's wire format; building it from
/// platform objects happens before a spec reaches this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub resource: ResourceRef,

    /// Name of the object on the appliance.
    pub name: String,

    pub admin_state_up: bool,

    #[serde(default)]
    pub body: serde_json::Value,
}

impl ResourceSpec {
    /// Spec named after the resource id, administratively up, with an empty body.
    pub fn new(resource: ResourceRef) -> Self {
        let name = resource.id.to_string();
        Self {
            resource,
            name,
            admin_state_up: true,
            body: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_admin_state(mut self, up: bool) -> Self {
        self.admin_state_up = up;
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }
}
