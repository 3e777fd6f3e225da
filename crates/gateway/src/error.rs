use thiserror::Error;

/// Failure modes of a Gateway request, as observed by callers of
/// `GatewayClient::request`.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum GatewayError {
    /// No response arrived within the caller's deadline.
    #[error("gateway request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The Gateway answered `ok: false`.
    #[error("gateway error {code}: {message}")]
    Remote {
        code: String,
        message: String,
        retryable: Option<bool>,
    },

    /// The socket closed while the request was in flight, or the request
    /// was issued against a closed client.
    #[error("gateway closed (code {code}): {reason}")]
    Closed { code: u16, reason: String },

    /// The client has no active connection epoch.
    #[error("gateway not connected")]
    NotConnected,

    /// Socket-level send failure.
    #[error("gateway transport failed: {0}")]
    Transport(String),

    /// Connect/handshake failure before a HelloOk was published.
    #[error("gateway handshake failed: {0}")]
    Handshake(String),
}

impl GatewayError {
    /// Whether a fresh attempt might succeed: timeouts and connection-level
    /// failures are worth retrying, remote errors only when flagged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::Closed { .. }
            | Self::NotConnected
            | Self::Transport(_) => true,
            Self::Remote { retryable, .. } => retryable.unwrap_or(false),
            Self::Handshake(_) => false,
        }
    }
}
