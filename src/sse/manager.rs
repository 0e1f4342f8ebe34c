use axum::BoxError;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::Stream;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::backpressure::{BackpressureConfig, BackpressureController, ThrottleReason};
use super::connection::{Connection, ConnectionId, ConnectionSnapshot, ConnectionState};
use super::error::{SseError, SseResult};
use super::event::SseEvent;
use super::queue::{DeliveryQueue, PushOutcome};
use super::registry::{ChannelInfo, Registry};
use super::responder::{EventStream, StreamOptions, StreamResponder};
use super::stats::{PerformanceStats, StatsSnapshot, StreamStats};
use crate::config::SseConfig;

/// Outcome of a backpressure evaluation for one pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThrottleDecision {
    Clear,
    Throttle {
        reason: ThrottleReason,
        delay: Duration,
    },
}

struct Inner {
    registry: Mutex<Registry>,
    stats: StreamStats,
    controller: BackpressureController,
    config: SseConfig,
}

/// Facade over the connection registry, channel index and statistics.
///
/// Cloning is cheap; all clones share the same state. Separate instances
/// share nothing, including statistics.
#[derive(Clone)]
pub struct EventManager {
    inner: Arc<Inner>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(SseConfig::default())
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("connections", &self.get_connection_count(None))
            .field("stats", &self.inner.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl EventManager {
    #[must_use]
    pub fn new(config: SseConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                stats: StreamStats::default(),
                controller: BackpressureController::new(config.backpressure.clone()),
                config,
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &SseConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn backpressure(&self) -> &BackpressureConfig {
        self.inner.controller.config()
    }

    // Streams

    /// Wraps `events` in a fully configured SSE response.
    pub fn create_event_stream<S, E>(&self, events: S, headers: Option<HeaderMap>) -> Response
    where
        S: Stream<Item = Result<SseEvent, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.create_event_stream_with(events, headers, StreamOptions::default())
    }

    pub fn create_event_stream_with<S, E>(
        &self,
        events: S,
        headers: Option<HeaderMap>,
        options: StreamOptions,
    ) -> Response
    where
        S: Stream<Item = Result<SseEvent, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        StreamResponder::new(self.clone(), events)
            .with_headers(headers.unwrap_or_default())
            .with_options(options)
            .into_response()
    }

    /// Registers a connection for `events` and returns the raw chunk stream.
    pub fn stream<S, E>(&self, events: S, options: StreamOptions) -> EventStream
    where
        S: Stream<Item = Result<SseEvent, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        StreamResponder::new(self.clone(), events)
            .with_options(options)
            .into_stream()
    }

    /// Opens a queue-backed stream that receives everything published to
    /// `channels`.
    pub fn open_channel_stream(
        &self,
        channels: Vec<String>,
        headers: Option<HeaderMap>,
        options: StreamOptions,
    ) -> Response {
        self.channel_responder(channels, options)
            .with_headers(headers.unwrap_or_default())
            .into_response()
    }

    #[must_use]
    pub fn channel_stream(&self, channels: Vec<String>, options: StreamOptions) -> EventStream {
        self.channel_responder(channels, options).into_stream()
    }

    fn channel_responder(
        &self,
        channels: Vec<String>,
        options: StreamOptions,
    ) -> StreamResponder<impl Stream<Item = Result<SseEvent, Infallible>> + Send + use<>> {
        let config = &self.inner.config;
        let queue = Arc::new(DeliveryQueue::new(config.queue_capacity, config.overflow_policy));
        let responder = StreamResponder::new(self.clone(), queue.clone().into_stream())
            .with_options(options.with_channels(channels))
            .with_queue(queue);

        if config.keep_alive_secs == 0 {
            responder
        } else {
            responder.with_keep_alive(config.keep_alive())
        }
    }

    // Channels

    /// Returns `false` when the connection is not registered.
    pub fn subscribe_to_channel(&self, connection_id: &str, channel: &str) -> bool {
        self.registry().subscribe(connection_id, channel)
    }

    /// Returns `false` when the connection is not registered. Channels left
    /// without subscribers are removed.
    pub fn unsubscribe_from_channel(&self, connection_id: &str, channel: &str) -> bool {
        self.registry().unsubscribe(connection_id, channel)
    }

    /// Pushes `event` onto the delivery queue of every subscriber of
    /// `channel`. Returns how many queues accepted it.
    pub fn publish(&self, channel: &str, event: &SseEvent) -> usize {
        let mut registry = self.registry();
        let ids = registry.subscribers(channel);
        self.deliver_to(&mut registry, &ids, event)
    }

    /// Publishes to every queue-backed connection regardless of channel.
    pub fn broadcast(&self, event: &SseEvent) -> usize {
        let mut registry = self.registry();
        let ids: Vec<ConnectionId> = registry
            .connections()
            .filter(|conn| conn.is_queue_backed())
            .map(|conn| conn.id.clone())
            .collect();
        self.deliver_to(&mut registry, &ids, event)
    }

    fn deliver_to(&self, registry: &mut Registry, ids: &[ConnectionId], event: &SseEvent) -> usize {
        let mut delivered = 0;
        for id in ids {
            let Some(conn) = registry.get_mut(id) else {
                continue;
            };
            let Some(queue) = conn.queue.clone() else {
                continue;
            };
            let outcome = queue.push(event.clone());
            conn.events_queued = queue.len();
            self.note_push(outcome, &queue);
            if outcome.accepted() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Pushes `event` to one connection's delivery queue.
    pub fn send_to(&self, connection_id: &str, event: SseEvent) -> SseResult<()> {
        let mut registry = self.registry();
        let conn = registry
            .get_mut(connection_id)
            .ok_or_else(|| SseError::ConnectionNotFound(connection_id.to_string()))?;
        let queue = conn
            .queue
            .clone()
            .ok_or_else(|| SseError::NoDeliveryQueue(connection_id.to_string()))?;

        let outcome = queue.push(event);
        conn.events_queued = queue.len();
        self.note_push(outcome, &queue);

        match outcome {
            PushOutcome::Queued | PushOutcome::DroppedOldest => Ok(()),
            PushOutcome::Rejected => Err(SseError::QueueFull {
                capacity: queue.capacity(),
            }),
            PushOutcome::Closed => Err(SseError::QueueClosed),
        }
    }

    fn note_push(&self, outcome: PushOutcome, queue: &DeliveryQueue) {
        if matches!(outcome, PushOutcome::DroppedOldest | PushOutcome::Rejected) {
            self.inner.stats.event_dropped(queue.policy().as_str());
        }
    }

    // Queries

    /// Active connections, or subscribers of `channel` when given.
    #[must_use]
    pub fn get_connection_count(&self, channel: Option<&str>) -> usize {
        self.registry().connection_count(channel)
    }

    #[must_use]
    pub fn get_performance_stats(&self) -> PerformanceStats {
        let (usages, channel_count) = {
            let registry = self.registry();
            let usages: Vec<f64> = registry.connections().map(Connection::buffer_usage).collect();
            (usages, registry.channel_count())
        };
        PerformanceStats::derive(self.inner.stats.snapshot(), channel_count, &usages)
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    #[must_use]
    pub fn connection_info(&self, connection_id: &str) -> Option<ConnectionSnapshot> {
        self.registry().get(connection_id).map(Connection::snapshot)
    }

    #[must_use]
    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        self.registry().channel_infos()
    }

    #[must_use]
    pub fn channel_subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        let mut ids = self.registry().subscribers(channel);
        ids.sort();
        ids
    }

    // Lifecycle

    /// Closes a queue-backed connection's delivery queue so its stream
    /// drains and ends. Returns `false` for unknown or producer-driven
    /// connections.
    pub fn disconnect(&self, connection_id: &str) -> bool {
        let registry = self.registry();
        match registry.get(connection_id).and_then(|conn| conn.queue.as_ref()) {
            Some(queue) => {
                queue.close();
                true
            }
            None => false,
        }
    }

    /// Closes every delivery queue. Producer-driven streams are unaffected.
    pub fn shutdown(&self) {
        let registry = self.registry();
        let mut closed = 0;
        for queue in registry.connections().filter_map(|conn| conn.queue.as_ref()) {
            queue.close();
            closed += 1;
        }
        info!(closed_queues = closed, "SSE event manager shutting down");
    }

    /// Unsubscribes the connection from all channels and removes it from
    /// the registry. Safe to call repeatedly; only the first call has any
    /// effect and returns `true`.
    pub fn cleanup_connection(&self, connection_id: &str) -> bool {
        let removed = {
            let mut registry = self.registry();
            if let Some(conn) = registry.get_mut(connection_id) {
                let _ = conn.transition(ConnectionState::Disconnecting);
            }
            registry.remove(connection_id)
        };
        let Some(mut conn) = removed else {
            return false;
        };

        if let Some(queue) = &conn.queue {
            queue.close();
        }
        let _ = conn.transition(ConnectionState::Disconnected);
        self.inner.stats.connection_closed();

        info!(
            connection_id = %conn.id,
            events_sent = conn.events_sent,
            bytes_sent = conn.bytes_sent,
            "SSE connection closed"
        );
        true
    }

    // Responder hooks

    pub(crate) fn register(
        &self,
        options: StreamOptions,
        queue: Option<Arc<DeliveryQueue>>,
    ) -> ConnectionId {
        let mut limits = self.inner.config.limits();
        if let Some(rate) = options.send_rate_limit {
            limits.send_rate_limit = rate;
        }
        if let Some(size) = options.max_buffer_size {
            limits.max_buffer_size = size;
        }
        if let Some(adaptive) = options.adaptive_throttling {
            limits.adaptive_throttling = adaptive;
        }

        let id = Connection::generate_id();
        let mut conn = Connection::new(id.clone(), limits);
        conn.metadata = options.metadata;
        conn.subscribed_channels.extend(options.channels);
        conn.queue = queue;

        let channels = conn.subscribed_channels.len();
        self.registry().insert(conn);
        self.inner.stats.connection_opened();

        info!(
            connection_id = %id,
            channels,
            send_rate_limit = limits.send_rate_limit,
            "SSE connection opened"
        );
        id
    }

    pub(crate) fn evaluate_throttle(&self, connection_id: &str) -> ThrottleDecision {
        let mut registry = self.registry();
        let Some(conn) = registry.get_mut(connection_id) else {
            return ThrottleDecision::Clear;
        };
        if let Some(queue) = &conn.queue {
            conn.events_queued = queue.len();
        }

        let controller = &self.inner.controller;
        let now = Instant::now();
        controller.update_client_buffer_estimate(conn, now);

        match controller.throttle_reason(conn, now) {
            Some(reason) => {
                let delay = controller.throttle_delay(conn, now);
                let _ = conn.transition(ConnectionState::Throttled);
                ThrottleDecision::Throttle { reason, delay }
            }
            None => ThrottleDecision::Clear,
        }
    }

    pub(crate) fn record_throttle(&self, reason: ThrottleReason) {
        self.inner.stats.throttled(reason);
    }

    pub(crate) fn record_send(&self, connection_id: &str, bytes: usize) {
        if let Some(conn) = self.registry().get_mut(connection_id) {
            conn.record_send(bytes, Instant::now());
            let _ = conn.transition(ConnectionState::Connected);
        }
        self.inner.stats.event_sent(bytes);
    }
}

/// Builds a complete SSE response for `events` on `manager`.
pub fn create_sse_response<S, E>(
    manager: &EventManager,
    events: S,
    headers: Option<HeaderMap>,
) -> Response
where
    S: Stream<Item = Result<SseEvent, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    manager.create_event_stream(events, headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::convert::Infallible;

    fn idle_stream(manager: &EventManager) -> EventStream {
        manager.stream(stream::pending::<Result<SseEvent, Infallible>>(), StreamOptions::default())
    }

    #[tokio::test]
    async fn test_registration_counts() {
        let manager = EventManager::default();
        let a = idle_stream(&manager);
        let _b = idle_stream(&manager);

        assert_eq!(manager.get_connection_count(None), 2);
        assert_eq!(manager.stats().total_connections, 2);
        assert_eq!(manager.stats().active_connections, 2);

        drop(a);
        assert_eq!(manager.get_connection_count(None), 1);
        assert_eq!(manager.stats().active_connections, 1);
        assert_eq!(manager.stats().total_connections, 2);
    }

    #[tokio::test]
    async fn test_subscribe_requires_registered_connection() {
        let manager = EventManager::default();
        assert!(!manager.subscribe_to_channel("nope", "news"));

        let conn = idle_stream(&manager);
        assert!(manager.subscribe_to_channel(conn.id(), "news"));
        assert_eq!(manager.get_connection_count(Some("news")), 1);

        assert!(manager.unsubscribe_from_channel(conn.id(), "news"));
        assert_eq!(manager.get_connection_count(Some("news")), 0);
        assert!(manager.list_channels().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let manager = EventManager::default();
        let conn = idle_stream(&manager);
        let id = conn.id().to_string();
        manager.subscribe_to_channel(&id, "news");

        assert!(manager.cleanup_connection(&id));
        assert!(!manager.cleanup_connection(&id));
        drop(conn);

        assert_eq!(manager.stats().active_connections, 0);
        assert_eq!(manager.get_connection_count(None), 0);
        assert_eq!(manager.get_connection_count(Some("news")), 0);
        assert!(!manager.subscribe_to_channel(&id, "news"));
    }

    #[tokio::test]
    async fn test_options_override_defaults() {
        let manager = EventManager::default();
        let conn = manager.stream(
            stream::pending::<Result<SseEvent, Infallible>>(),
            StreamOptions::default()
                .with_rate_limit(2.5)
                .with_buffer_size(1024)
                .with_adaptive_throttling(false)
                .with_metadata("user", "alice"),
        );

        let info = manager.connection_info(conn.id()).unwrap();
        assert!((info.send_rate_limit - 2.5).abs() < f64::EPSILON);
        assert_eq!(info.max_buffer_size, 1024);
        assert!(!info.adaptive_throttling);
        assert_eq!(info.metadata.get("user").map(String::as_str), Some("alice"));
        assert_eq!(info.state, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_send_to_errors() {
        let manager = EventManager::default();
        assert!(matches!(
            manager.send_to("missing", SseEvent::new("x")),
            Err(SseError::ConnectionNotFound(_))
        ));

        let plain = idle_stream(&manager);
        assert!(matches!(
            manager.send_to(plain.id(), SseEvent::new("x")),
            Err(SseError::NoDeliveryQueue(_))
        ));

        let queued = manager.channel_stream(vec![], StreamOptions::default());
        manager.send_to(queued.id(), SseEvent::new("x")).unwrap();
        assert_eq!(manager.connection_info(queued.id()).unwrap().events_queued, 1);

        assert!(manager.disconnect(queued.id()));
        assert!(matches!(
            manager.send_to(queued.id(), SseEvent::new("y")),
            Err(SseError::QueueClosed)
        ));
        assert!(!manager.disconnect(plain.id()));
    }

    #[tokio::test]
    async fn test_reject_new_reports_queue_full() {
        let manager = EventManager::new(SseConfig {
            queue_capacity: 1,
            overflow_policy: crate::sse::OverflowPolicy::RejectNew,
            ..SseConfig::default()
        });
        let conn = manager.channel_stream(vec!["news".to_string()], StreamOptions::default());

        assert_eq!(manager.publish("news", &SseEvent::new("1")), 1);
        assert_eq!(manager.publish("news", &SseEvent::new("2")), 0);
        assert!(matches!(
            manager.send_to(conn.id(), SseEvent::new("3")),
            Err(SseError::QueueFull { capacity: 1 })
        ));
        assert_eq!(manager.stats().events_dropped, 2);
    }

    #[tokio::test]
    async fn test_independent_managers_do_not_share_stats() {
        let first = EventManager::default();
        let second = EventManager::default();
        let _conn = idle_stream(&first);

        assert_eq!(first.stats().total_connections, 1);
        assert_eq!(second.stats().total_connections, 0);
    }
}
