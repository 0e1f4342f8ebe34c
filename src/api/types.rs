use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub const fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Query string of `GET /api/events/stream`.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Comma-separated channel names.
    pub channels: Option<String>,

    /// Per-connection override of the configured events-per-second limit.
    pub rate_limit: Option<f64>,
}

impl StreamQuery {
    #[must_use]
    pub fn channel_list(&self) -> Vec<String> {
        self.channels
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct PublishResult {
    pub channel: String,
    pub delivered: usize,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResult {
    pub id: String,
    pub disconnected: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub active_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_list_parsing() {
        let query = StreamQuery {
            channels: Some(" news, ,sports,".to_string()),
            rate_limit: None,
        };
        assert_eq!(query.channel_list(), vec!["news", "sports"]);
        assert!(StreamQuery::default().channel_list().is_empty());
    }

    #[test]
    fn test_error_response_omits_data() {
        let body = serde_json::to_value(ApiResponse::<()>::error("boom")).unwrap();
        assert_eq!(body, serde_json::json!({"success": false, "error": "boom"}));
    }
}
