//! WebSocket close-code interpretation
//!
//! Maps raw close codes (RFC 6455 §7.4.1) to a classification with an
//! actionable hint, so errors never surface as a bare number.

use std::fmt;

use tokio_tungstenite::tungstenite;

/// Normal closure; not an error
pub const NORMAL_CLOSURE: u16 = 1000;
/// Connection dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const PROTOCOL_ERROR: u16 = 1002;
pub const POLICY_VIOLATION: u16 = 1008;
pub const TLS_HANDSHAKE_FAILURE: u16 = 1015;

/// Actionable category of a transport close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClassification {
    /// Check connectivity and the model URL
    NetworkOrHandshake,
    /// Check the `openai-beta.realtime=v1` subprotocol
    ProtocolViolation,
    /// Ephemeral token or subprotocol rejected
    AuthOrPolicy,
    TlsFailure,
    Unknown,
}

impl CloseClassification {
    pub fn from_code(code: u16) -> Self {
        match code {
            ABNORMAL_CLOSURE => CloseClassification::NetworkOrHandshake,
            PROTOCOL_ERROR => CloseClassification::ProtocolViolation,
            POLICY_VIOLATION => CloseClassification::AuthOrPolicy,
            TLS_HANDSHAKE_FAILURE => CloseClassification::TlsFailure,
            _ => CloseClassification::Unknown,
        }
    }

    pub fn hint(&self) -> &'static str {
        match self {
            CloseClassification::NetworkOrHandshake => {
                "Network/handshake problem, check connectivity and the model URL"
            }
            CloseClassification::ProtocolViolation => {
                "Protocol error, ensure the openai-beta.realtime=v1 subprotocol is sent"
            }
            CloseClassification::AuthOrPolicy => {
                "Auth/policy issue, the ephemeral token or subprotocols were rejected"
            }
            CloseClassification::TlsFailure => "TLS/SSL problem",
            CloseClassification::Unknown => "Unknown cause",
        }
    }
}

impl fmt::Display for CloseClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.hint())
    }
}

/// Standard meaning of a close code
pub fn close_code_meaning(code: u16) -> &'static str {
    match code {
        1000 => "Normal closure",
        1001 => "Going away",
        1002 => "Protocol error",
        1003 => "Unsupported data",
        1006 => "Abnormal closure",
        1007 => "Invalid frame payload data",
        1008 => "Policy violation",
        1009 => "Message too big",
        1010 => "Mandatory extension missing",
        1011 => "Internal server error",
        1015 => "TLS handshake failure",
        _ => "Unknown close code",
    }
}

/// Whether a close code indicates something went wrong
pub fn is_closed_for_cause(code: u16) -> bool {
    code != NORMAL_CLOSURE
}

/// Synthesize a close code for transport errors that carry no close frame
pub fn code_for_transport_error(err: &tungstenite::Error) -> u16 {
    use tungstenite::error::ProtocolError;
    use tungstenite::Error;

    match err {
        Error::Tls(_) => TLS_HANDSHAKE_FAILURE,
        // Peer vanished without a close frame
        Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => ABNORMAL_CLOSURE,
        Error::Protocol(_) | Error::Utf8 | Error::Capacity(_) => PROTOCOL_ERROR,
        Error::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            POLICY_VIOLATION
        }
        _ => ABNORMAL_CLOSURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        assert_eq!(
            CloseClassification::from_code(1006),
            CloseClassification::NetworkOrHandshake
        );
        assert_eq!(
            CloseClassification::from_code(1002),
            CloseClassification::ProtocolViolation
        );
        assert_eq!(
            CloseClassification::from_code(1008),
            CloseClassification::AuthOrPolicy
        );
        assert_eq!(
            CloseClassification::from_code(1015),
            CloseClassification::TlsFailure
        );
        assert_eq!(CloseClassification::from_code(1011), CloseClassification::Unknown);
        assert_eq!(CloseClassification::from_code(4000), CloseClassification::Unknown);
    }

    #[test]
    fn test_close_code_meaning() {
        assert_eq!(close_code_meaning(1006), "Abnormal closure");
        assert_eq!(close_code_meaning(4242), "Unknown close code");
    }

    #[test]
    fn test_closed_for_cause() {
        assert!(!is_closed_for_cause(1000));
        assert!(is_closed_for_cause(1001));
        assert!(is_closed_for_cause(1006));
    }

    #[test]
    fn test_transport_error_codes() {
        assert_eq!(
            code_for_transport_error(&tungstenite::Error::ConnectionClosed),
            ABNORMAL_CLOSURE
        );
        assert_eq!(code_for_transport_error(&tungstenite::Error::Utf8), PROTOCOL_ERROR);
        assert_eq!(
            code_for_transport_error(&tungstenite::Error::Protocol(
                tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
            )),
            ABNORMAL_CLOSURE
        );

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(
            code_for_transport_error(&tungstenite::Error::Io(io)),
            ABNORMAL_CLOSURE
        );
    }
}
