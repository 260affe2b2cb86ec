//! WebSocket wire protocol.
//!
//! Every frame is a JSON object discriminated by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → server frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame of every connection
    Auth {
        /// Identity of the connecting user
        user_id: String,
    },
    /// Add topics or categories to the subscription set
    Subscribe {
        /// Topics (`pipeline.posted`), categories (`pipeline`, `pipeline.*`) or `all`
        #[serde(default)]
        event_types: Vec<String>,
    },
    /// Remove topics or categories from the subscription set
    Unsubscribe {
        /// Entries to remove
        #[serde(default)]
        event_types: Vec<String>,
    },
    /// Application-level keepalive
    Ping,
}

/// Server → client frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once authentication succeeds
    Connected {
        /// Server-assigned connection id
        client_id: String,
        /// Connection time
        timestamp: DateTime<Utc>,
    },
    /// A forwarded or targeted event
    Event {
        /// First segment of the topic
        category: String,
        /// Topic
        event_type: String,
        /// Payload
        data: Value,
        /// Event time
        timestamp: DateTime<Utc>,
        /// Publishing component
        source: String,
    },
    /// Answer to `ping`
    Pong {
        /// Reply time
        timestamp: DateTime<Utc>,
    },
    /// Subscription set after a `subscribe`
    Subscribed {
        /// Current subscriptions
        event_types: Vec<String>,
    },
    /// Subscription set after an `unsubscribe`
    Unsubscribed {
        /// Current subscriptions
        event_types: Vec<String>,
    },
    /// Authentication or protocol error
    Error {
        /// Description
        message: String,
    },
}

impl ServerMessage {
    /// Error frame
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What the transport should write to a client
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A protocol frame
    Message(ServerMessage),
    /// A transport-level liveness ping; the transport reports the pong via
    /// [`WebSocketManager::touch`](super::WebSocketManager::touch)
    Ping,
}

/// Subscription key for a requested entry: `pipeline.*` becomes `pipeline`.
#[must_use]
pub fn normalize_subscription(entry: &str) -> String {
    entry
        .strip_suffix(".*")
        .unwrap_or(entry)
        .trim()
        .to_string()
}
