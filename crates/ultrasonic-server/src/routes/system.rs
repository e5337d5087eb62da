use crate::routes::ApiError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.manager.system_status();
    Json(json!({
        "status": "ok",
        "version": status.version,
        "running_count": status.running_count,
    }))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.manager.system_status();
    Json(json!(status))
}

pub async fn performance(State(state): State<Arc<AppState>>) -> Json<Value> {
    let pipelines = state.manager.performance();
    let total_frames: u64 = pipelines.iter().map(|p| p.total_frames).sum();
    let total_dropped: u64 = pipelines.iter().map(|p| p.total_dropped).sum();
    let overruns: u64 = pipelines.iter().map(|p| p.overruns).sum();
    Json(json!({
        "total_frames": total_frames,
        "total_dropped": total_dropped,
        "overruns": overruns,
        "pipelines": pipelines,
    }))
}

pub async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "devices": state.manager.list_devices() }))
}

pub async fn refresh_devices(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let devices = state
        .manager
        .refresh_devices()
        .map_err(|e| ApiError::from_operation("refresh-devices", "*", e))?;
    Ok(Json(json!({ "count": devices.len(), "devices": devices })))
}

pub async fn stop_all(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.manager.stop_all();
    Json(json!({ "stopped": true }))
}

pub async fn cleanup(State(state): State<Arc<AppState>>) -> Json<Value> {
    let removed = state.manager.cleanup();
    Json(json!({ "removed": removed }))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub ids: Vec<String>,
}

pub async fn batch_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> Json<Value> {
    Json(json!({ "results": state.manager.batch_start(&req.ids) }))
}

pub async fn batch_stop(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> Json<Value> {
    Json(json!({ "results": state.manager.batch_stop(&req.ids) }))
}
