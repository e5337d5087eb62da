use crate::{routes, shutdown, state};
use anyhow::Context;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn router(state: Arc<state::AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .route("/api/system/status", get(routes::system::status))
        .route("/api/system/performance", get(routes::system::performance))
        .route("/api/system/stop-all", post(routes::system::stop_all))
        .route("/api/system/cleanup", post(routes::system::cleanup))
        .route("/api/devices", get(routes::system::list_devices))
        .route("/api/devices/refresh", post(routes::system::refresh_devices))
        .route("/api/devices/batch-start", post(routes::system::batch_start))
        .route("/api/devices/batch-stop", post(routes::system::batch_stop))
        .route("/api/device/:id/start", post(routes::device::start))
        .route("/api/device/:id/stop", post(routes::device::stop))
        .route("/api/device/:id/restart", post(routes::device::restart))
        .route("/api/device/:id/status", get(routes::device::status))
        .route("/api/device/:id/stream", get(routes::stream::device_stream))
        .route(
            "/api/device/:id/stream-config",
            get(routes::device::get_stream_config).put(routes::device::set_stream_config),
        )
        .route(
            "/api/device/:id/audio-config",
            get(routes::device::get_audio_config).put(routes::device::set_audio_config),
        )
        .route("/api/device/:id", delete(routes::device::remove))
        .route("/start", post(routes::legacy::start))
        .route("/stop", post(routes::legacy::stop))
        .route("/status", get(routes::legacy::status))
        .route("/stream", get(routes::legacy::stream))
        .route("/set-stream-config", post(routes::legacy::set_stream_config))
        .route("/set-fps", post(routes::legacy::set_fps))
        .layer(TraceLayer::new_for_http())
        // Visualizers live on other origins; the surface carries no
        // credentials.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: Arc<state::AppState>) -> anyhow::Result<()> {
    let host = state.manager.config().server.host.clone();
    let port = state.manager.config().server.port;
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host
    };
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("parse bind address")?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(bind = %addr, "server listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await?;
    Ok(())
}
