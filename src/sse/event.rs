use serde::{Deserialize, Serialize};

use super::error::SseResult;
use super::json;

/// Payload carried by a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    /// Structured payload, rendered with the framework JSON encoder.
    Json(serde_json::Value),
    /// Emitted verbatim without JSON quoting.
    Text(String),
    /// Raw bytes, decoded as UTF-8 when rendered.
    Bytes(Vec<u8>),
}

impl EventData {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> SseResult<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Renders the payload as the text that is split into `data:` lines.
    pub fn render(&self) -> SseResult<String> {
        match self {
            // Null renders as `None`, not `null`.
            Self::Json(serde_json::Value::Null) => Ok("None".to_string()),
            Self::Json(value) => json::to_string(value),
            Self::Text(text) => Ok(text.clone()),
            Self::Bytes(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

impl From<serde_json::Value> for EventData {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(text) => Self::Text(text),
            other => Self::Json(other),
        }
    }
}

impl From<String> for EventData {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for EventData {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for EventData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

/// One server-sent event record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event_type: Option<String>,
    /// Reconnection hint in milliseconds.
    pub retry: Option<u64>,
    pub data: EventData,
}

impl SseEvent {
    pub fn new(data: impl Into<EventData>) -> Self {
        Self {
            id: None,
            event_type: None,
            retry: None,
            data: data.into(),
        }
    }

    pub fn json<T: Serialize + ?Sized>(value: &T) -> SseResult<Self> {
        Ok(Self::new(EventData::json(value)?))
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }
}

/// Loosely typed event as accepted over HTTP: `{id?, type?, retry?, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(
        rename = "type",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
    pub data: serde_json::Value,
}

impl From<EventRecord> for SseEvent {
    fn from(record: EventRecord) -> Self {
        Self {
            id: record.id,
            event_type: record.event_type,
            retry: record.retry,
            data: record.data.into(),
        }
    }
}
