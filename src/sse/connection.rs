use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use super::error::{SseError, SseResult};
use super::queue::DeliveryQueue;

pub type ConnectionId = String;

/// Lifecycle of one streaming client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Throttled,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    const fn rank(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Connected | Self::Throttled => 1,
            Self::Disconnecting => 2,
            Self::Disconnected => 3,
        }
    }

    /// Forward-only, except that `Connected` and `Throttled` may alternate.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Connected, Self::Throttled) | (Self::Throttled, Self::Connected) => true,
            _ => next.rank() > self.rank(),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Throttled => "throttled",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection backpressure parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionLimits {
    /// Events per second.
    pub send_rate_limit: f64,
    /// Bytes.
    pub max_buffer_size: usize,
    pub adaptive_throttling: bool,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            send_rate_limit: 10.0,
            max_buffer_size: 65_536,
            adaptive_throttling: true,
        }
    }
}

/// One open SSE stream session.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub state: ConnectionState,

    pub events_sent: u64,
    pub events_queued: usize,
    pub bytes_sent: u64,

    pub send_rate_limit: f64,
    pub max_buffer_size: usize,
    pub adaptive_throttling: bool,

    /// Heuristic estimate of bytes not yet consumed by the client.
    pub client_buffer_estimate: f64,

    pub subscribed_channels: HashSet<String>,
    pub metadata: HashMap<String, String>,

    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub last_send_time: Option<Instant>,
    pub last_buffer_update: Option<Instant>,

    pub(crate) queue: Option<Arc<DeliveryQueue>>,
}

impl Connection {
    pub fn new(id: ConnectionId, limits: ConnectionLimits) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            events_sent: 0,
            events_queued: 0,
            bytes_sent: 0,
            send_rate_limit: limits.send_rate_limit,
            max_buffer_size: limits.max_buffer_size,
            adaptive_throttling: limits.adaptive_throttling,
            client_buffer_estimate: 0.0,
            subscribed_channels: HashSet::new(),
            metadata: HashMap::new(),
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            last_send_time: None,
            last_buffer_update: None,
            queue: None,
        }
    }

    /// Generates a process-unique id from the current time and a random suffix.
    #[must_use]
    pub fn generate_id() -> ConnectionId {
        format!(
            "sse_{}_{:08x}",
            Utc::now().timestamp_millis(),
            rand::random::<u32>()
        )
    }

    pub fn transition(&mut self, next: ConnectionState) -> SseResult<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(SseError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Estimated client buffer usage as a fraction of `max_buffer_size`.
    #[must_use]
    pub fn buffer_usage(&self) -> f64 {
        if self.max_buffer_size == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let max = self.max_buffer_size as f64;
        self.client_buffer_estimate / max
    }

    /// Records a successfully produced chunk of `bytes` length.
    pub fn record_send(&mut self, bytes: usize, now: Instant) {
        self.events_sent += 1;
        self.bytes_sent += bytes as u64;
        #[allow(clippy::cast_precision_loss)]
        let added = bytes as f64;
        self.client_buffer_estimate += added;
        self.last_send_time = Some(now);
        self.last_activity = now;
    }

    #[must_use]
    pub fn is_queue_backed(&self) -> bool {
        self.queue.is_some()
    }

    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let mut channels: Vec<String> = self.subscribed_channels.iter().cloned().collect();
        channels.sort();

        ConnectionSnapshot {
            id: self.id.clone(),
            state: self.state,
            events_sent: self.events_sent,
            events_queued: self.events_queued,
            bytes_sent: self.bytes_sent,
            send_rate_limit: self.send_rate_limit,
            max_buffer_size: self.max_buffer_size,
            adaptive_throttling: self.adaptive_throttling,
            client_buffer_estimate: self.client_buffer_estimate,
            buffer_usage_percent: self.buffer_usage() * 100.0,
            subscribed_channels: channels,
            metadata: self.metadata.clone(),
            connected_at: self.connected_at,
            idle_ms: u64::try_from(self.last_activity.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Serializable view of a [`Connection`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub events_sent: u64,
    pub events_queued: usize,
    pub bytes_sent: u64,
    pub send_rate_limit: f64,
    pub max_buffer_size: usize,
    pub adaptive_throttling: bool,
    pub client_buffer_estimate: f64,
    pub buffer_usage_percent: f64,
    pub subscribed_channels: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub connected_at: DateTime<Utc>,
    pub idle_ms: u64,
}
