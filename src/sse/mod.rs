//! Server-Sent Events streaming with adaptive backpressure.
//!
//! [`EventManager`] owns the connection registry, the channel index and the
//! aggregate statistics. Streams are built through it, either from a
//! caller-supplied producer or from a per-connection delivery queue fed by
//! [`EventManager::publish`].

pub mod backpressure;
pub mod connection;
pub mod error;
pub mod event;
pub mod format;
pub mod json;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod responder;
pub mod stats;

pub use backpressure::{BackpressureConfig, BackpressureController, MIN_SEND_RATE, ThrottleReason};
pub use connection::{Connection, ConnectionId, ConnectionLimits, ConnectionSnapshot, ConnectionState};
pub use error::{SseError, SseResult};
pub use event::{EventData, EventRecord, SseEvent};
pub use format::MessageFormatter;
pub use manager::{EventManager, create_sse_response};
pub use queue::{DeliveryQueue, OverflowPolicy, PushOutcome};
pub use registry::ChannelInfo;
pub use responder::{EventStream, StreamOptions, StreamResponder, default_headers};
pub use stats::{PerformanceStats, StatsSnapshot};
