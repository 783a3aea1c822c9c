//! Health, device and metrics routes

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use camera_control::SessionSnapshot;
use camera_driver::{CameraDriver, Device};
use serde::Serialize;

use crate::AppState;

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub camera: SessionSnapshot,
}

/// GET /api/v1/health
pub async fn health<D: CameraDriver>(
    State(state): State<Arc<AppState<D>>>,
) -> Json<HealthResponse> {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let camera = state.session.snapshot();

    Json(HealthResponse {
        status: if camera.closed { "closed" } else { "healthy" }.to_string(),
        timestamp,
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        camera,
    })
}

/// GET /api/v1/devices
pub async fn devices<D: CameraDriver>(State(state): State<Arc<AppState<D>>>) -> Json<Vec<Device>> {
    Json(state.session.devices().to_vec())
}

/// GET /metrics
pub async fn metrics<D: CameraDriver>(State(state): State<Arc<AppState<D>>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
