pub mod device;
pub mod legacy;
pub mod stream;
pub mod system;

use crate::capture::CaptureError;
use crate::manager::ManagerError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Control-surface failure as the client sees it: which device, which
/// operation, what went wrong. Never a backtrace.
pub struct ApiError {
    status: StatusCode,
    message: String,
    stable_id: Option<String>,
    operation: &'static str,
}

impl ApiError {
    pub fn too_many_subscribers(stable_id: &str) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: format!("too many subscribers on {stable_id}"),
            stable_id: Some(stable_id.to_string()),
            operation: "stream",
        }
    }

    /// Classify an operation failure by the typed error at its root.
    pub fn from_operation(operation: &'static str, stable_id: &str, err: anyhow::Error) -> Self {
        let status = if let Some(m) = err.downcast_ref::<ManagerError>() {
            match m {
                ManagerError::UnknownDevice(_) | ManagerError::NoDevices => StatusCode::NOT_FOUND,
                ManagerError::NotStopped(_) => StatusCode::CONFLICT,
            }
        } else if let Some(c) = err.downcast_ref::<CaptureError>() {
            match c {
                CaptureError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
                CaptureError::DeviceBusy(_) => StatusCode::CONFLICT,
                CaptureError::UnsupportedRate { .. } => StatusCode::BAD_REQUEST,
                CaptureError::Stream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            }
        } else {
            // Config validation and similar synchronous rejections.
            StatusCode::BAD_REQUEST
        };
        Self {
            status,
            message: err.to_string(),
            stable_id: Some(stable_id.to_string()),
            operation,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let operation = if self.operation.is_empty() {
            None
        } else {
            Some(self.operation)
        };
        let body = json!({
            "error": self.message,
            "stable_id": self.stable_id,
            "operation": operation,
        });
        (self.status, Json(body)).into_response()
    }
}
