//! Data model shared between the push server, the work queue, the message
//! processor and the backend client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A work item posted by the backend to the push endpoint.
///
/// `message_id` is the backend's sole identity for the item and doubles as
/// the idempotency key for chat sends, so redeliveries of the same message
/// dedupe at the Gateway.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InboundMessage {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at_ms: Option<i64>,
    pub input: TaskInput,
}

/// What the backend wants done with an inbound message.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TaskInput {
    Chat {
        session_key: String,
        message_text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        media: Vec<MediaItem>,
    },
    Handshake {
        nonce: String,
    },
    SessionNew {},
}

/// Inline media attached to a chat task. Audio items feed the transcription
/// pre-flight; file items are staged to disk and referenced by path in the
/// outgoing message.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MediaItem {
    Audio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        content_base64: String,
    },
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        content_base64: String,
    },
}

impl MediaItem {
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::Audio { file_name, .. } | Self::File { file_name, .. } => file_name.as_deref(),
        }
    }

    pub fn content_base64(&self) -> &str {
        match self {
            Self::Audio { content_base64, .. } | Self::File { content_base64, .. } => {
                content_base64
            }
        }
    }
}

/// Error codes surfaced to the backend in `error` outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayErrorCode {
    RelayInternalError,
    GatewayTimeout,
    GatewayError,
    Aborted,
    NoRunId,
    UsageRequired,
}

impl RelayErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RelayInternalError => "RELAY_INTERNAL_ERROR",
            Self::GatewayTimeout => "GATEWAY_TIMEOUT",
            Self::GatewayError => "GATEWAY_ERROR",
            Self::Aborted => "ABORTED",
            Self::NoRunId => "NO_RUN_ID",
            Self::UsageRequired => "USAGE_REQUIRED",
        }
    }
}

impl std::fmt::Display for RelayErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of one chat task as produced by the chat runner.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatRunResult {
    Reply {
        message: Value,
        run_id: String,
        media: Vec<OutboundMedia>,
    },
    NoReply {
        run_id: String,
    },
    Error {
        code: RelayErrorCode,
        message: String,
        run_id: Option<String>,
    },
}

/// A media attachment scraped from the Gateway transcript for an outgoing
/// reply, base64-encoded with a sniffed content type.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMedia {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub content_type: String,
    pub content_base64: String,
}

/// Outcome discriminator in the backend callback.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Reply,
    NoReply,
    Error,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyOutcome {
    /// Absent for relay-internal replies (handshake probe, session
    /// rotation) that never touched a chat run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub message: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<OutboundMedia>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NoReplyOutcome {
    pub run_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOutcome {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// The terminal callback posted to the backend, exactly once per processed
/// message.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeReport {
    pub relay_instance_id: String,
    pub relay_message_id: String,
    pub finished_at_ms: i64,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_reply: Option<NoReplyOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openclaw_meta: Option<Value>,
}

impl OutcomeReport {
    pub fn from_result(
        relay_instance_id: &str,
        relay_message_id: &str,
        finished_at_ms: i64,
        result: ChatRunResult,
        openclaw_meta: Option<Value>,
    ) -> Self {
        let mut report = Self {
            relay_instance_id: relay_instance_id.to_string(),
            relay_message_id: relay_message_id.to_string(),
            finished_at_ms,
            outcome: Outcome::Error,
            reply: None,
            no_reply: None,
            error: None,
            openclaw_meta,
        };
        match result {
            ChatRunResult::Reply {
                message,
                run_id,
                media,
            } => {
                report.outcome = Outcome::Reply;
                report.reply = Some(ReplyOutcome {
                    run_id: Some(run_id),
                    message,
                    media,
                });
            }
            ChatRunResult::NoReply { run_id } => {
                report.outcome = Outcome::NoReply;
                report.no_reply = Some(NoReplyOutcome { run_id });
            }
            ChatRunResult::Error {
                code,
                message,
                run_id,
            } => {
                report.outcome = Outcome::Error;
                report.error = Some(ErrorOutcome {
                    code: code.as_str().to_string(),
                    message,
                    run_id,
                });
            }
        }
        report
    }
}
