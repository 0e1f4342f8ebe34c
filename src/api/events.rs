use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, header},
    response::Response,
    routing::{get, post},
};
use std::sync::Arc;
use tracing::{debug, info};

use super::{ApiError, ApiResponse, AppState, DisconnectResult, PublishResult, StreamQuery};
use crate::sse::{
    ChannelInfo, ConnectionSnapshot, EventRecord, MIN_SEND_RATE, PerformanceStats, SseEvent,
    StreamOptions,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events/stream", get(stream_events))
        .route("/events/publish/{channel}", post(publish_event))
        .route("/events/stats", get(get_stats))
        .route("/events/channels", get(list_channels))
        .route(
            "/events/connections/{id}",
            get(get_connection).delete(disconnect_connection),
        )
        .route("/events/connections/{id}/send", post(send_event))
}

/// Opens a channel-backed event stream.
///
/// # Endpoint
/// `GET /api/events/stream?channels=a,b&rate_limit=5`
async fn stream_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let mut options = StreamOptions::default();
    if let Some(rate) = query.rate_limit {
        if !rate.is_finite() || rate < MIN_SEND_RATE {
            return Err(ApiError::validation(format!(
                "rate_limit must be a number >= {MIN_SEND_RATE}"
            )));
        }
        options = options.with_rate_limit(rate);
    }
    if let Some(agent) = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()) {
        options = options.with_metadata("user_agent", agent);
    }

    let channels = query.channel_list();
    debug!(channels = ?channels, "Opening channel stream");
    Ok(state.events.open_channel_stream(channels, None, options))
}

/// Publishes one event to every subscriber of a channel.
///
/// # Endpoint
/// `POST /api/events/publish/{channel}`
async fn publish_event(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Json(record): Json<EventRecord>,
) -> Result<Json<ApiResponse<PublishResult>>, ApiError> {
    if channel.trim().is_empty() {
        return Err(ApiError::validation("Channel name cannot be empty"));
    }

    let event = SseEvent::from(record);
    let delivered = state.events.publish(&channel, &event);
    info!(channel = %channel, delivered, "Published event");

    Ok(Json(ApiResponse::success(PublishResult { channel, delivered })))
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<ApiResponse<PerformanceStats>> {
    Json(ApiResponse::success(state.events.get_performance_stats()))
}

async fn list_channels(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<ChannelInfo>>> {
    Json(ApiResponse::success(state.events.list_channels()))
}

async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<ConnectionSnapshot>>, ApiError> {
    let snapshot = state
        .events
        .connection_info(&id)
        .ok_or_else(|| ApiError::connection_not_found(&id))?;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// Ends a channel stream after its pending events have been delivered.
///
/// # Endpoint
/// `DELETE /api/events/connections/{id}`
async fn disconnect_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<DisconnectResult>>, ApiError> {
    if state.events.connection_info(&id).is_none() {
        return Err(ApiError::connection_not_found(&id));
    }
    if !state.events.disconnect(&id) {
        return Err(ApiError::Conflict(format!(
            "Connection '{id}' is not a channel stream"
        )));
    }

    Ok(Json(ApiResponse::success(DisconnectResult {
        id,
        disconnected: true,
    })))
}

/// Sends one event directly to a single channel stream.
///
/// # Endpoint
/// `POST /api/events/connections/{id}/send`
async fn send_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(record): Json<EventRecord>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state.events.send_to(&id, SseEvent::from(record))?;
    Ok(Json(ApiResponse::success(())))
}
