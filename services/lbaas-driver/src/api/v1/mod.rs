//! API v1 routes.

mod devices;
mod tenants;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/devices", devices::routes())
        // Placement lookups: /v1/tenants/{tenant_id}/device
        .nest("/tenants/{tenant_id}", tenants::routes())
}
