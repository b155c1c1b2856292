//! Typed view of pushed events.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::frame::EventFrame;

pub const CHAT_EVENT: &str = "chat";
pub const TICK_EVENT: &str = "tick";
pub const SHUTDOWN_EVENT: &str = "shutdown";
/// Synthesized locally when a run goes quiet.
pub const STREAM_TIMEOUT_EVENT: &str = "stream.timeout";
/// Synthesized locally when the connection leaves `Ready`.
pub const CONNECTION_LOST_EVENT: &str = "connection.lost";

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Chat(ChatEvent),
    Tick,
    Shutdown { reason: Option<String> },
    StreamTimeout { run_id: String, idle_ms: u64 },
    ConnectionLost { reason: String },
    Other { name: String, payload: Value },
}

impl GatewayEvent {
    pub fn from_frame(frame: EventFrame) -> Self {
        match frame.name.as_str() {
            CHAT_EVENT => match serde_json::from_value::<ChatEvent>(frame.payload.clone()) {
                Ok(chat) => Self::Chat(chat),
                Err(error) => {
                    warn!(
                        target: "openagents.gateway",
                        %error,
                        "chat event payload did not match the expected shape"
                    );
                    Self::Other {
                        name: frame.name,
                        payload: frame.payload,
                    }
                }
            },
            TICK_EVENT => Self::Tick,
            SHUTDOWN_EVENT => Self::Shutdown {
                reason: frame
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            },
            _ => Self::Other {
                name: frame.name,
                payload: frame.payload,
            },
        }
    }

    /// Wire (or synthetic) event name used for subscription matching.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Chat(_) => CHAT_EVENT,
            Self::Tick => TICK_EVENT,
            Self::Shutdown { .. } => SHUTDOWN_EVENT,
            Self::StreamTimeout { .. } => STREAM_TIMEOUT_EVENT,
            Self::ConnectionLost { .. } => CONNECTION_LOST_EVENT,
            Self::Other { name, .. } => name,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::Chat(chat) => chat.run_id.as_deref(),
            Self::StreamTimeout { run_id, .. } => Some(run_id),
            _ => None,
        }
    }

    /// Payload as it would appear on the wire, for logging and forwarding.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::Chat(chat) => serde_json::to_value(chat).unwrap_or(Value::Null),
            Self::Tick => Value::Null,
            Self::Shutdown { reason } => json!({ "reason": reason }),
            Self::StreamTimeout { run_id, idle_ms } => {
                json!({ "runId": run_id, "idleMs": idle_ms })
            }
            Self::ConnectionLost { reason } => json!({ "reason": reason }),
            Self::Other { payload, .. } => payload.clone(),
        }
    }
}

/// Incremental chat output for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub state: ChatState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChatEvent {
    /// Flattened text carried by this event, empty when there is none.
    #[must_use]
    pub fn text(&self) -> String {
        self.message
            .as_ref()
            .map(|message| message.content.to_text())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Delta,
    Final,
    Aborted,
    Error,
}

impl ChatState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Delta)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub content: ChatContent,
}

/// Message content: a plain string or typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for ChatContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl ChatContent {
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter(|part| part.kind == "text")
                .filter_map(|part| part.text.as_deref())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}
