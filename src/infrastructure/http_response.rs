// HTTP response utilities - JSON envelopes and error status mapping
use crate::application::error::ControllerError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub fn status_for(err: &ControllerError) -> StatusCode {
    match err {
        ControllerError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        ControllerError::Device(_) => StatusCode::BAD_GATEWAY,
        ControllerError::AlreadyRunning
        | ControllerError::NotRunning
        | ControllerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ControllerError::UnknownCycle(_) | ControllerError::NoData => StatusCode::NOT_FOUND,
        ControllerError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "Request failed: {}", self);
        } else {
            tracing::debug!(status = status.as_u16(), "Request refused: {}", self);
        }
        let body = Json(json!({ "success": false, "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// `{"success": true, "message": ...}`
pub fn success(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "message": message.into() }))
}
