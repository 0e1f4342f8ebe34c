use axum::BoxError;
use thiserror::Error;

use super::connection::ConnectionState;

/// Errors produced by the streaming engine.
#[derive(Debug, Error)]
pub enum SseError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Event producer failed: {0}")]
    Producer(BoxError),

    #[error("Invalid connection state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Connection {0} has no delivery queue")]
    NoDeliveryQueue(String),

    #[error("Delivery queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Delivery queue is closed")]
    QueueClosed,
}

impl SseError {
    pub fn producer(err: impl Into<BoxError>) -> Self {
        Self::Producer(err.into())
    }
}

pub type SseResult<T> = Result<T, SseError>;
