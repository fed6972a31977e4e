//! Realtime conversation session
//!
//! Owns everything between "we have a session config" and "frames are
//! flowing": credential fetching, the wire protocol, the connection state
//! machine and reconnect policy.
//!
//! # Architecture
//!
//! ```text
//! connect_with_retry ──attempt──▶ SessionConnection ──fetch──▶ CredentialSource
//!                                      │
//!                     ┌────────────────┴────────────────┐
//!                     ▼                                 ▼
//!               reader task                        writer task
//!        (decode, dispatch events)          (encode frames in order)
//!                     │                                 ▲
//!                     ▼                                 │
//!           SessionEvent channel              OutboundSender (bridge)
//! ```

pub mod close_code;
pub mod connection;
pub mod credential;
pub mod instructions;
pub mod protocol;
pub mod retry;
pub mod transcript;

use std::fmt;
use std::time::Duration;

pub use close_code::CloseClassification;
pub use connection::{
    ConnectionSettings, OutboundSender, SessionConnection, SessionEvent, SessionEventReceiver,
};
pub use credential::{Credential, CredentialError, CredentialSource, HttpCredentialFetcher};
pub use instructions::{Language, PracticeSetup, ProficiencyLevel};
pub use protocol::{ApiErrorInfo, InboundEvent, OutboundEvent, SessionConfig};
pub use retry::{connect_with_retry, Connector, RetryPolicy};
pub use transcript::{Speaker, TranscriptEntry, TranscriptLog};

use crate::audio::AudioError;

/// Errors surfaced by a realtime session
///
/// Every variant displays an actionable message; this is what the UI shows.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Connection timed out: the session did not open within {0:?}")]
    ConnectionTimeout(Duration),

    #[error(
        "WebSocket closed ({code} - {}){}. Hint: {classification}",
        close_code::close_code_meaning(*code),
        reason_suffix(reason)
    )]
    Transport {
        code: u16,
        classification: CloseClassification,
        reason: String,
    },

    #[error("Invalid API key. Please check your OpenAI API key.")]
    InvalidApiKey,

    #[error("Realtime API error: {}", api_message(.0))]
    Api(ApiErrorInfo),

    #[error("Invalid realtime endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Not connected to a conversation")]
    NotConnected,

    #[error(transparent)]
    Audio(#[from] AudioError),
}

impl ClientError {
    /// Build a transport error, classifying the close code
    pub fn transport(code: u16, reason: impl Into<String>) -> Self {
        ClientError::Transport {
            code,
            classification: CloseClassification::from_code(code),
            reason: reason.into(),
        }
    }

    /// Map a server `error` frame, singling out a rejected key
    pub fn from_api(info: ApiErrorInfo) -> Self {
        if info.is_invalid_api_key() {
            ClientError::InvalidApiKey
        } else {
            ClientError::Api(info)
        }
    }

    pub fn classification(&self) -> Option<CloseClassification> {
        match self {
            ClientError::Transport { classification, .. } => Some(*classification),
            _ => None,
        }
    }
}

fn api_message(info: &ApiErrorInfo) -> &str {
    if info.message.trim().is_empty() {
        "Unknown API error occurred"
    } else {
        &info.message
    }
}

fn reason_suffix(reason: &str) -> String {
    if reason.is_empty() {
        String::new()
    } else {
        format!(": {}", reason)
    }
}

/// Lifecycle of one session connection
///
/// ```text
/// Idle ──connect──▶ Connecting ──session.created──▶ Open ──close──▶ Closing ──▶ Closed
///                        │                            │
///                        └──────── failure ──────────▶ Failed ──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_message_is_actionable() {
        let err = ClientError::transport(1006, "");
        let message = err.to_string();

        assert!(message.contains("1006"));
        assert!(message.contains("Abnormal closure"));
        assert!(message.contains("check connectivity"));
        assert_eq!(
            err.classification(),
            Some(CloseClassification::NetworkOrHandshake)
        );
    }

    #[test]
    fn test_transport_error_includes_reason() {
        let err = ClientError::transport(1008, "bad subprotocol");
        assert!(err.to_string().contains("Policy violation): bad subprotocol"));
    }

    #[test]
    fn test_invalid_api_key_mapping() {
        let info = ApiErrorInfo {
            error_type: "invalid_request_error".to_string(),
            code: Some("invalid_api_key".to_string()),
            message: "Incorrect API key provided".to_string(),
            param: None,
        };

        let err = ClientError::from_api(info);
        assert_eq!(err, ClientError::InvalidApiKey);
        assert_eq!(
            err.to_string(),
            "Invalid API key. Please check your OpenAI API key."
        );
    }

    #[test]
    fn test_api_error_without_message() {
        let err = ClientError::from_api(ApiErrorInfo::default());
        assert_eq!(err.to_string(), "Realtime API error: Unknown API error occurred");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert!(ConnectionState::Open.is_open());
        assert!(!ConnectionState::Closing.is_open());
    }
}
