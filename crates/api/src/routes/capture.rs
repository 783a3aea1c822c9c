//! Mode and capture routes

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use camera_control::{ModeRequest, OperatingMode, Transition};
use camera_driver::CameraDriver;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::{blocking, AppState};

/// Query parameters for the capture routes
#[derive(Debug, Default, Deserialize)]
pub struct CaptureQuery {
    /// File name under the output directory
    pub name: Option<String>,
    /// Exposure time in seconds
    pub exposure: Option<f64>,
    pub gain: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct ModeResponse {
    pub mode: OperatingMode,
    /// The device was reconfigured
    pub switched: bool,
}

#[derive(Debug, Serialize)]
pub struct CaptureResponse {
    pub path: String,
    pub exposure_s: f64,
    pub gain: i32,
}

/// GET /preview
pub async fn preview<D: CameraDriver>(
    State(state): State<Arc<AppState<D>>>,
) -> Result<Json<ModeResponse>, ApiError> {
    let transition = blocking(&state, |session| session.request_mode(ModeRequest::Preview)).await?;
    Ok(Json(ModeResponse {
        mode: OperatingMode::Preview,
        switched: transition != Transition::Unchanged,
    }))
}

/// GET /capture
pub async fn capture<D: CameraDriver>(
    State(state): State<Arc<AppState<D>>>,
    Query(query): Query<CaptureQuery>,
) -> Result<Json<CaptureResponse>, ApiError> {
    let params = state.session.settings().capture_params(query.exposure, query.gain);
    let name = query.name;
    let path = blocking(&state, move |session| {
        session.capture_to_file(params, name.as_deref())
    })
    .await?;

    Ok(Json(CaptureResponse {
        path: path.display().to_string(),
        exposure_s: params.exposure_s,
        gain: params.gain,
    }))
}

/// GET /capture1
pub async fn capture_region<D: CameraDriver>(
    State(state): State<Arc<AppState<D>>>,
    Query(query): Query<CaptureQuery>,
) -> Result<Response, ApiError> {
    let params = state.session.settings().capture_params(query.exposure, query.gain);
    let png = blocking(&state, move |session| session.capture_region(params)).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}
