//! Wire types for the duplex correlated-frame protocol spoken with the
//! Gateway over a WebSocket. Frames are JSON text messages; `id` is the
//! sole correlation key between a `req` and its `res`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol window offered during the handshake.
pub const MIN_PROTOCOL: u32 = 1;
pub const MAX_PROTOCOL: u32 = 3;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req {
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl Frame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::serialize)
    }

    /// Decode a single text frame. Malformed text is an error the caller is
    /// expected to log and drop; it never faults the connection.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::deserialize)
    }
}

/// Error payload carried by a failed `res`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Server-sent handshake payload, valid for one connection epoch.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    pub protocol: u32,
    pub policy: HelloPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<HelloFeatures>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    pub tick_interval_ms: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloFeatures {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Event names the client routes internally.
pub const EVENT_TICK: &str = "tick";
pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";
pub const EVENT_CHAT: &str = "chat";

/// Methods the client issues.
pub const METHOD_CONNECT: &str = "connect";
pub const METHOD_CHAT_SEND: &str = "chat.send";
pub const METHOD_CHAT_ABORT: &str = "chat.abort";
pub const METHOD_SESSIONS_USAGE: &str = "sessions.usage";

/// Lifecycle state of a chat run as reported by `chat` events.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Delta,
    Final,
    Error,
    Aborted,
    #[serde(other)]
    Other,
}

impl ChatState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Final | Self::Error | Self::Aborted)
    }
}

/// Payload of a `chat` event.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub state: ChatState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("protocol error: {message}")]
pub struct ProtocolError {
    message: String,
}

impl ProtocolError {
    fn serialize(err: serde_json::Error) -> Self {
        Self {
            message: format!("serialize failed: {err}"),
        }
    }

    fn deserialize(err: serde_json::Error) -> Self {
        Self {
            message: format!("deserialize failed: {err}"),
        }
    }
}
