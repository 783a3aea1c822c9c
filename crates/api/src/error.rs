//! API error type and its HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use camera_control::ControlError;
use camera_driver::ErrorKind;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Camera(#[from] ControlError),

    /// The blocking worker panicked or was cancelled
    #[error("Camera worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: String,
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Camera(e) => e.kind(),
            ApiError::Worker(_) => ErrorKind::Unknown,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::DeviceBusy => StatusCode::CONFLICT,
            ErrorKind::InvalidParameter => StatusCode::BAD_REQUEST,
            ErrorKind::NoDevice => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_driver::CameraError;

    fn driver(kind: ErrorKind) -> ApiError {
        ApiError::Camera(CameraError::new(kind, "CameraGetImageBuffer", "test").into())
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(driver(ErrorKind::Timeout).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(driver(ErrorKind::DeviceBusy).status(), StatusCode::CONFLICT);
        assert_eq!(driver(ErrorKind::InvalidParameter).status(), StatusCode::BAD_REQUEST);
        assert_eq!(driver(ErrorKind::NoDevice).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(driver(ErrorKind::FileError).status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError::Worker("gone".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_transition_busy_is_conflict() {
        let err = ApiError::from(ControlError::TransitionBusy(10_000));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }
}
