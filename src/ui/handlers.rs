//! HTTP API handlers

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::error::{ControlError, Error};
use crate::lifecycle::Snapshot;
use crate::protocol::StartRequest;
use crate::ui::server::AppState;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn failure<T>(err: Error) -> ApiResult<T> {
    let code = match err {
        Error::Control(ControlError::ControllerGone) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Control(_) | Error::Network(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(ApiResponse::error(err.to_string())))
}

/// Current controller snapshot
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Snapshot>> {
    Json(ApiResponse::ok(state.controller.snapshot()))
}

/// Start streaming; replaces any running stream
pub async fn start_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> ApiResult<Snapshot> {
    match state.controller.start(&req.server_url, &req.serial) {
        Ok(identity) => {
            tracing::info!("Start requested over HTTP for {}", identity);
            (StatusCode::ACCEPTED, Json(ApiResponse::ok(state.controller.snapshot())))
        }
        Err(e) => {
            tracing::warn!("Rejected start request: {}", e);
            failure(e)
        }
    }
}

/// Stop streaming and cancel any pending reconnect
pub async fn stop_stream(State(state): State<Arc<AppState>>) -> ApiResult<()> {
    match state.controller.stop() {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(e) => failure(e),
    }
}
