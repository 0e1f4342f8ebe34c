//! Turns an event stream into a chunked `text/event-stream` response.
//!
//! Each connection is registered with its [`EventManager`] before the first
//! event is pulled and is cleaned up exactly once, whether the producer ends,
//! fails, or the body is dropped because the client went away.

use axum::BoxError;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::connection::ConnectionId;
use super::error::SseError;
use super::event::SseEvent;
use super::format::MessageFormatter;
use super::backpressure::ThrottleReason;
use super::manager::{EventManager, ThrottleDecision};
use super::queue::DeliveryQueue;

/// Comment chunk sent on idle channel streams. Clients ignore it.
pub const KEEP_ALIVE: &[u8] = b": keep-alive\n\n";

/// Floor for throttle sleeps so a zero delay cannot spin.
const MIN_PAUSE: Duration = Duration::from_millis(1);

/// Per-connection overrides for a new stream.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub send_rate_limit: Option<f64>,
    pub max_buffer_size: Option<usize>,
    pub adaptive_throttling: Option<bool>,
    /// Channels the connection joins as soon as it is registered.
    pub channels: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl StreamOptions {
    #[must_use]
    pub const fn with_rate_limit(mut self, events_per_sec: f64) -> Self {
        self.send_rate_limit = Some(events_per_sec);
        self
    }

    #[must_use]
    pub const fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.max_buffer_size = Some(bytes);
        self
    }

    #[must_use]
    pub const fn with_adaptive_throttling(mut self, enabled: bool) -> Self {
        self.adaptive_throttling = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels.extend(channels.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Default headers for every event stream. Caller headers override these.
#[must_use]
pub fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert("x-sse-backpressure", HeaderValue::from_static("enabled"));
    headers
}

fn merge_headers(mut base: HeaderMap, custom: &HeaderMap) -> HeaderMap {
    for name in custom.keys() {
        base.remove(name);
    }
    for (name, value) in custom {
        base.append(name.clone(), value.clone());
    }
    base
}

/// Builder for one streaming response.
pub struct StreamResponder<S> {
    manager: EventManager,
    events: S,
    headers: HeaderMap,
    options: StreamOptions,
    queue: Option<Arc<DeliveryQueue>>,
    keep_alive: Option<Duration>,
}

impl<S, E> StreamResponder<S>
where
    S: Stream<Item = Result<SseEvent, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    pub fn new(manager: EventManager, events: S) -> Self {
        Self {
            manager,
            events,
            headers: HeaderMap::new(),
            options: StreamOptions::default(),
            queue: None,
            keep_alive: None,
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub(crate) fn with_queue(mut self, queue: Arc<DeliveryQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Emits a comment chunk whenever the producer stays idle for `interval`.
    #[must_use]
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = Some(interval);
        self
    }

    /// Registers the connection and returns its byte stream.
    #[must_use]
    pub fn into_stream(self) -> EventStream {
        let id = self.manager.register(self.options, self.queue);
        let guard = ConnectionGuard {
            manager: self.manager.clone(),
            id: id.clone(),
        };

        let driver = Driver {
            events: Box::pin(self.events),
            manager: self.manager,
            guard,
            keep_alive: self.keep_alive,
            finished: false,
        };

        let inner = stream::unfold(driver, |mut driver| async move {
            let item = driver.next_chunk().await?;
            Some((item, driver))
        })
        .boxed();

        EventStream { id, inner }
    }
}

impl<S, E> IntoResponse for StreamResponder<S>
where
    S: Stream<Item = Result<SseEvent, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    /// Registers the connection and builds the HTTP response.
    fn into_response(self) -> Response {
        let headers = merge_headers(default_headers(), &self.headers);
        let stream = self.into_stream();

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = StatusCode::OK;
        *response.headers_mut() = headers;
        response
    }
}

/// Formatted SSE chunks for one connection.
///
/// Ends after the producer is exhausted. A producer or serialization failure
/// is yielded as the final `Err` item, after the connection has been cleaned up.
pub struct EventStream {
    id: ConnectionId,
    inner: BoxStream<'static, Result<Bytes, SseError>>,
}

impl EventStream {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Stream for EventStream {
    type Item = Result<Bytes, SseError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Runs connection cleanup when dropped.
struct ConnectionGuard {
    manager: EventManager,
    id: ConnectionId,
}

impl ConnectionGuard {
    fn close(&self) {
        self.manager.cleanup_connection(&self.id);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.close();
    }
}

struct Driver<S> {
    events: Pin<Box<S>>,
    manager: EventManager,
    guard: ConnectionGuard,
    keep_alive: Option<Duration>,
    finished: bool,
}

impl<S, E> Driver<S>
where
    S: Stream<Item = Result<SseEvent, E>>,
    E: Into<BoxError>,
{
    async fn next_chunk(&mut self) -> Option<Result<Bytes, SseError>> {
        if self.finished {
            return None;
        }

        let next = match self.keep_alive {
            Some(interval) => match tokio::time::timeout(interval, self.events.next()).await {
                Ok(next) => next,
                Err(_) => return Some(Ok(Bytes::from_static(KEEP_ALIVE))),
            },
            None => self.events.next().await,
        };

        let result = match next {
            None => {
                self.finish();
                return None;
            }
            Some(Err(err)) => Err(SseError::producer(err)),
            Some(Ok(event)) => deliver(&self.manager, &self.guard.id, &event).await,
        };

        if let Err(err) = &result {
            warn!(connection_id = %self.guard.id, error = %err, "SSE stream terminated by error");
            self.finish();
        }
        Some(result)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.guard.close();
    }
}

async fn deliver(manager: &EventManager, id: &str, event: &SseEvent) -> Result<Bytes, SseError> {
    wait_for_capacity(manager, id).await;

    let payload = MessageFormatter::format(event)?;
    manager.record_send(id, payload.len());
    Ok(Bytes::from(payload))
}

/// Delays (never drops) the event while a throttle rule holds, up to the
/// configured maximum wait.
///
/// The queue-depth rule costs one `throttle_delay` per event: the backlog it
/// measures only shrinks as this connection sends.
async fn wait_for_capacity(manager: &EventManager, id: &str) {
    let deadline = Instant::now() + manager.backpressure().max_throttle_wait();
    let mut counted = false;

    while let ThrottleDecision::Throttle { reason, delay } = manager.evaluate_throttle(id) {
        if !counted {
            manager.record_throttle(reason);
            debug!(
                connection_id = %id,
                reason = reason.as_str(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Throttling SSE connection"
            );
            counted = true;
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let pause = delay.max(MIN_PAUSE).min(deadline - now);
        tokio::time::sleep(pause).await;

        if reason == ThrottleReason::QueueDepth {
            break;
        }
    }
}
