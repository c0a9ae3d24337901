//! Tenant placement lookups.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use lbaas_id::TenantId;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::resolver::PlacementMode;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/device", get(resolve_device))
}

#[derive(Debug, Serialize)]
pub struct TenantDeviceResponse {
    pub tenant_id: String,
    pub device: String,
    pub host: String,

    /// "hash" or "hash_with_binding".
    pub placement: &'static str,
}

async fn resolve_device(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<TenantDeviceResponse>, ApiError> {
    let tenant_id = TenantId::parse(&tenant_id)
        .map_err(|e| ApiError::bad_request("invalid_tenant_id", e.to_string()))?;

    let device = state.resolver().resolve(&tenant_id).await?;

    let placement = match state.resolver().mode() {
        PlacementMode::Hash => "hash",
        PlacementMode::HashWithBinding => "hash_with_binding",
    };

    Ok(Json(TenantDeviceResponse {
        tenant_id: tenant_id.to_string(),
        device: device.name.to_string(),
        host: device.host,
        placement,
    }))
}
