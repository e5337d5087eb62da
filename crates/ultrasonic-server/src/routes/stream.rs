use crate::pipeline::DevicePipeline;
use crate::routes::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use ultrasonic_core::broadcast::Subscription;
use ultrasonic_core::util;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub async fn device_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let pipeline = state
        .manager
        .pipeline(&id)
        .map_err(|e| ApiError::from_operation("stream", &id, e))?;
    subscribe_sse(&state, pipeline)
}

/// Shared by the per-device and legacy stream endpoints: bounded
/// subscription, one JSON wire frame per SSE event, keep-alives in between.
pub fn subscribe_sse(
    state: &Arc<AppState>,
    pipeline: Arc<DevicePipeline>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let limit = state.manager.config().limits.subscribers_per_device;
    if pipeline.subscriber_count() >= limit {
        return Err(ApiError::too_many_subscribers(pipeline.stable_id()));
    }

    let guard = SubscriberGuard {
        stable_id: pipeline.stable_id().to_string(),
        subscriber_id: util::generate_subscriber_id(),
    };
    tracing::info!(
        stable_id = %guard.stable_id,
        subscriber_id = %guard.subscriber_id,
        "stream subscriber connected"
    );

    let subscription = pipeline.subscribe();
    let events = stream::unfold(
        (subscription, guard),
        |(mut subscription, guard): (Subscription, SubscriberGuard)| async move {
            let frame = subscription.next().await?;
            let data = match serde_json::to_string(frame.as_ref()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize wire frame");
                    "{}".to_string()
                }
            };
            let event = Event::default()
                .event("spectrum")
                .id(frame.sequence_id.to_string())
                .data(data);
            Some((Ok(event), (subscription, guard)))
        },
    );

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}

/// Logs the disconnect when the SSE stream (and with it the subscription)
/// is dropped.
struct SubscriberGuard {
    stable_id: String,
    subscriber_id: String,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        tracing::info!(
            stable_id = %self.stable_id,
            subscriber_id = %self.subscriber_id,
            "stream subscriber disconnected"
        );
    }
}
