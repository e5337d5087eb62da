//! Single-stream control surface kept for older visualizers: it operates on
//! the first running pipeline, falling back to the preferred input device.

use crate::routes::stream::subscribe_sse;
use crate::routes::ApiError;
use crate::state::AppState;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use ultrasonic_core::config::StreamConfigUpdate;

pub async fn start(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let pipeline = state
        .manager
        .default_pipeline()
        .map_err(|e| ApiError::from_operation("start", "default", e))?;
    pipeline
        .start()
        .map_err(|e| ApiError::from_operation("start", pipeline.stable_id(), e))?;
    Ok(Json(json!({ "stable_id": pipeline.stable_id(), "started": true })))
}

pub async fn stop(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let pipeline = state
        .manager
        .default_pipeline()
        .map_err(|e| ApiError::from_operation("stop", "default", e))?;
    pipeline.stop();
    Ok(Json(json!({ "stable_id": pipeline.stable_id(), "stopped": true })))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let pipeline = state
        .manager
        .default_pipeline()
        .map_err(|e| ApiError::from_operation("status", "default", e))?;
    Ok(Json(json!(pipeline.status())))
}

pub async fn stream(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let pipeline = state
        .manager
        .default_pipeline()
        .map_err(|e| ApiError::from_operation("stream", "default", e))?;
    subscribe_sse(&state, pipeline)
}

pub async fn set_stream_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<StreamConfigUpdate>,
) -> Result<Json<Value>, ApiError> {
    let pipeline = state
        .manager
        .default_pipeline()
        .map_err(|e| ApiError::from_operation("set-stream-config", "default", e))?;
    let applied = pipeline
        .update_stream(&update)
        .map_err(|e| ApiError::from_operation("set-stream-config", pipeline.stable_id(), e))?;
    Ok(Json(json!(applied)))
}

#[derive(Debug, Deserialize)]
pub struct SetFpsRequest {
    pub fps: u32,
}

pub async fn set_fps(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetFpsRequest>,
) -> Result<Json<Value>, ApiError> {
    let update = StreamConfigUpdate {
        target_fps: Some(req.fps),
        ..StreamConfigUpdate::default()
    };
    set_stream_config(State(state), Json(update)).await
}
