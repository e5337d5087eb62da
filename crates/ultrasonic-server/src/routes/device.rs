use crate::routes::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use ultrasonic_core::config::{AudioConfigUpdate, StreamConfigUpdate};

pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .manager
        .start(&id)
        .map_err(|e| ApiError::from_operation("start", &id, e))?;
    Ok(Json(json!({ "stable_id": id, "started": true })))
}

pub async fn stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .manager
        .stop(&id)
        .map_err(|e| ApiError::from_operation("stop", &id, e))?;
    Ok(Json(json!({ "stable_id": id, "stopped": true })))
}

pub async fn restart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .manager
        .restart(&id)
        .map_err(|e| ApiError::from_operation("restart", &id, e))?;
    Ok(Json(json!({ "stable_id": id, "restarted": true })))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state
        .manager
        .status(&id)
        .map_err(|e| ApiError::from_operation("status", &id, e))?;
    Ok(Json(json!(status)))
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<Json<Value>, ApiError> {
    state
        .manager
        .remove(&id, query.force)
        .map_err(|e| ApiError::from_operation("remove", &id, e))?;
    Ok(Json(json!({ "stable_id": id, "removed": true })))
}

pub async fn get_stream_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let pipeline = state
        .manager
        .pipeline(&id)
        .map_err(|e| ApiError::from_operation("get-stream-config", &id, e))?;
    Ok(Json(json!(pipeline.stream_config())))
}

pub async fn set_stream_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<StreamConfigUpdate>,
) -> Result<Json<Value>, ApiError> {
    let applied = state
        .manager
        .update_stream(&id, &update)
        .map_err(|e| ApiError::from_operation("set-stream-config", &id, e))?;
    Ok(Json(json!(applied)))
}

pub async fn get_audio_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let pipeline = state
        .manager
        .pipeline(&id)
        .map_err(|e| ApiError::from_operation("get-audio-config", &id, e))?;
    Ok(Json(json!(pipeline.audio_snapshot())))
}

pub async fn set_audio_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<AudioConfigUpdate>,
) -> Result<Json<Value>, ApiError> {
    let applied = state
        .manager
        .update_audio(&id, &update)
        .map_err(|e| ApiError::from_operation("set-audio-config", &id, e))?;
    Ok(Json(json!(applied)))
}
