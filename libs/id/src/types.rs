//! Typed ID definitions.

use crate::define_id;

define_id!(
    /// A tenant (project) of the orchestration platform.
    TenantId
);

define_id!(
    /// The registry name of a load-balancing appliance.
    DeviceId
);

define_id!(
    /// A load balancer, listener, pool, member or health monitor.
    ResourceId
);
