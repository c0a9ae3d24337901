//! Registered devices.
//!
//! Connection details are listed without credentials.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::registry::Device;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_devices))
}

#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub api_version: String,
    pub port_stats: bool,
}

impl From<&Device> for DeviceResponse {
    fn from(device: &Device) -> Self {
        Self {
            name: device.name.to_string(),
            host: device.host.clone(),
            port: device.port,
            protocol: device.protocol.clone(),
            api_version: device.api_version.clone(),
            port_stats: device.exposes_port_stats(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListDevicesResponse {
    pub items: Vec<DeviceResponse>,

    /// Identifies the ring built from `items`.
    pub ring_fingerprint: String,
    pub ring_replicas: u32,
}

async fn list_devices(State(state): State<AppState>) -> Json<ListDevicesResponse> {
    let snapshot = state.registry().snapshot();
    Json(ListDevicesResponse {
        items: snapshot.devices().map(DeviceResponse::from).collect(),
        ring_fingerprint: snapshot.ring().fingerprint(),
        ring_replicas: snapshot.ring().replicas(),
    })
}
