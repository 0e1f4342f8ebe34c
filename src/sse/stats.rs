use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::backpressure::ThrottleReason;

/// Aggregate counters owned by one event manager.
///
/// Every update is mirrored to the global `metrics` recorder. The active
/// gauge moves by deltas, so it sums over every manager in the process.
#[derive(Debug, Default)]
pub struct StreamStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    events_sent: AtomicU64,
    backpressure_throttles: AtomicU64,
    bytes_streamed: AtomicU64,
    events_dropped: AtomicU64,
}

impl StreamStats {
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);

        metrics::counter!("sse_connections_total").increment(1);
        metrics::gauge!("sse_connections_active").increment(1.0);
    }

    /// Decrements the active count, saturating at zero.
    pub fn connection_closed(&self) {
        let decremented = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();

        if decremented {
            metrics::gauge!("sse_connections_active").decrement(1.0);
        }
    }

    pub fn event_sent(&self, bytes: usize) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_streamed.fetch_add(bytes as u64, Ordering::Relaxed);

        metrics::counter!("sse_events_sent_total").increment(1);
        metrics::counter!("sse_bytes_streamed_total").increment(bytes as u64);
    }

    pub fn throttled(&self, reason: ThrottleReason) {
        self.backpressure_throttles.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sse_backpressure_throttles_total", "reason" => reason.as_str())
            .increment(1);
    }

    pub fn event_dropped(&self, policy: &'static str) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sse_events_dropped_total", "policy" => policy).increment(1);
    }

    /// Zeroes every counter. Intended for tests and debugging only.
    pub fn reset(&self) {
        self.total_connections.store(0, Ordering::Relaxed);
        let active = self.active_connections.swap(0, Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("sse_connections_active").decrement(active as f64);
        self.events_sent.store(0, Ordering::Relaxed);
        self.backpressure_throttles.store(0, Ordering::Relaxed);
        self.bytes_streamed.store(0, Ordering::Relaxed);
        self.events_dropped.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            backpressure_throttles: self.backpressure_throttles.load(Ordering::Relaxed),
            bytes_streamed: self.bytes_streamed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub events_sent: u64,
    pub backpressure_throttles: u64,
    pub bytes_streamed: u64,
    pub events_dropped: u64,
}

/// Counters plus metrics derived at call time. The derived values are
/// diagnostic only.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    #[serde(flatten)]
    pub counters: StatsSnapshot,
    pub channel_count: usize,
    pub throttle_rate_percent: f64,
    pub average_buffer_usage_percent: f64,
    pub average_event_bytes: f64,
}

impl PerformanceStats {
    #[must_use]
    pub fn derive(counters: StatsSnapshot, channel_count: usize, buffer_usages: &[f64]) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let ratio = |num: u64, den: u64| {
            if den == 0 { 0.0 } else { num as f64 / den as f64 }
        };

        #[allow(clippy::cast_precision_loss)]
        let average_buffer_usage_percent = if buffer_usages.is_empty() {
            0.0
        } else {
            buffer_usages.iter().sum::<f64>() / buffer_usages.len() as f64 * 100.0
        };

        Self {
            counters,
            channel_count,
            throttle_rate_percent: ratio(counters.backpressure_throttles, counters.events_sent)
                * 100.0,
            average_buffer_usage_percent,
            average_event_bytes: ratio(counters.bytes_streamed, counters.events_sent),
        }
    }
}
