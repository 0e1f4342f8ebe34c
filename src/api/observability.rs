use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::api::AppState;

/// Prometheus scrape endpoint.
///
/// Gauges that are derived rather than event-driven are refreshed right
/// before rendering.
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(handle) = state.prometheus_handle.as_ref() else {
        return "Metrics not enabled or failed to initialize".to_string();
    };

    let perf = state.events.get_performance_stats();
    #[allow(clippy::cast_precision_loss)]
    let channels = perf.channel_count as f64;
    metrics::gauge!("sse_channels").set(channels);
    metrics::gauge!("sse_buffer_usage_percent_avg").set(perf.average_buffer_usage_percent);

    handle.render()
}

const fn outcome(status: u16) -> &'static str {
    match status {
        500.. => "error",
        400..500 => "client_error",
        _ => "success",
    }
}

/// Request span, `http_requests_total` / `http_request_duration_seconds`
/// and one summary log line per request.
///
/// Event streams are measured up to the response head only; their lifetime
/// is tracked by the engine's own connection metrics.
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().to_string();
    let uri = req.uri().path().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string());

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %uri,
        route = route.as_deref(),
    );

    async move {
        let response = next.run(req).await;
        let status = response.status().as_u16();
        let elapsed = start.elapsed();

        // unmatched paths would blow up label cardinality
        let labels = [
            ("method", method),
            ("path", route.unwrap_or_else(|| "unmatched".to_string())),
            ("status", status.to_string()),
        ];
        metrics::counter!("http_requests_total", &labels).increment(1);
        metrics::histogram!("http_request_duration_seconds", &labels)
            .record(elapsed.as_secs_f64());

        let streaming = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .is_some_and(|ct| ct.as_bytes().starts_with(b"text/event-stream"));

        info!(
            event = "http_request_finished",
            duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            status_code = status,
            outcome = outcome(status),
            streaming,
            "Request finished"
        );

        response
    }
    .instrument(span)
    .await
}
