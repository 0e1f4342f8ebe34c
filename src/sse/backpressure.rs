//! Adaptive backpressure for streaming connections.
//!
//! The client's receive buffer cannot be observed from the HTTP layer, so
//! buffer occupancy is a heuristic: every sent chunk adds its size to
//! [`Connection::client_buffer_estimate`] and the estimate drains linearly
//! over wall-clock time at `drain_rate_bytes_per_sec`. Exact values are not
//! authoritative; only the throttle decision built on top of them is.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::connection::Connection;

/// Smallest send rate accepted from configuration or HTTP overrides
/// (one event per 1000 seconds).
pub const MIN_SEND_RATE: f64 = 0.001;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Fraction of `max_buffer_size` at which the buffer rule fires.
    pub buffer_threshold: f64,

    /// Queue depth above which the queue rule fires.
    pub max_queue_depth: usize,

    /// Assumed client consumption rate used to decay the buffer estimate.
    pub drain_rate_bytes_per_sec: f64,

    /// Sleep between re-evaluations when throttled by buffer or queue rules.
    pub throttle_delay_ms: u64,

    /// Upper bound on the time one event waits for throttling to clear.
    pub max_throttle_wait_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: 0.85,
            max_queue_depth: 50,
            drain_rate_bytes_per_sec: 32_768.0,
            throttle_delay_ms: 50,
            max_throttle_wait_ms: 2_000,
        }
    }
}

impl BackpressureConfig {
    #[must_use]
    pub const fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }

    #[must_use]
    pub const fn max_throttle_wait(&self) -> Duration {
        Duration::from_millis(self.max_throttle_wait_ms)
    }
}

/// The rule that caused a throttle decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    RateLimit,
    BufferFull,
    QueueDepth,
}

impl ThrottleReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::BufferFull => "buffer_full",
            Self::QueueDepth => "queue_depth",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackpressureController {
    config: BackpressureConfig,
}

impl BackpressureController {
    #[must_use]
    pub const fn new(config: BackpressureConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    #[must_use]
    pub fn should_throttle(&self, connection: &Connection, now: Instant) -> bool {
        self.throttle_reason(connection, now).is_some()
    }

    /// Evaluates the rate, buffer and queue rules in that order and returns
    /// the first one that fires.
    #[must_use]
    pub fn throttle_reason(&self, connection: &Connection, now: Instant) -> Option<ThrottleReason> {
        if !connection.adaptive_throttling {
            return None;
        }

        if rate_limit_remaining(connection, now).is_some() {
            return Some(ThrottleReason::RateLimit);
        }

        if connection.buffer_usage() >= self.config.buffer_threshold {
            return Some(ThrottleReason::BufferFull);
        }

        if connection.events_queued > self.config.max_queue_depth {
            return Some(ThrottleReason::QueueDepth);
        }

        None
    }

    /// How long to wait before re-evaluating a throttled connection.
    #[must_use]
    pub fn throttle_delay(&self, connection: &Connection, now: Instant) -> Duration {
        rate_limit_remaining(connection, now).unwrap_or_else(|| self.config.throttle_delay())
    }

    /// Decays the buffer estimate by the time elapsed since the previous
    /// update. The first call only records a baseline.
    pub fn update_client_buffer_estimate(&self, connection: &mut Connection, now: Instant) {
        if let Some(previous) = connection.last_buffer_update {
            let elapsed = now.saturating_duration_since(previous).as_secs_f64();
            let drained = elapsed * self.config.drain_rate_bytes_per_sec;
            connection.client_buffer_estimate = (connection.client_buffer_estimate - drained).max(0.0);
        }
        connection.last_buffer_update = Some(now);
    }
}

/// Remaining time before the rate limit allows the next send, if any.
fn rate_limit_remaining(connection: &Connection, now: Instant) -> Option<Duration> {
    if connection.events_sent == 0 {
        return None;
    }
    let rate = connection.send_rate_limit;
    if !rate.is_finite() || rate <= 0.0 {
        return None;
    }
    let last = connection.last_send_time?;

    // rates too small for a Duration block the rate rule indefinitely; the
    // caller's max wait still bounds each event
    let min_interval = Duration::try_from_secs_f64(1.0 / rate).unwrap_or(Duration::MAX);
    let elapsed = now.saturating_duration_since(last);
    (elapsed < min_interval).then(|| min_interval - elapsed)
}
