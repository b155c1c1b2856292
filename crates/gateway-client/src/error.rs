use std::time::Duration;

use openagents_gateway_proto::{ErrorShape, HandshakeCode};
use serde_json::Value;
use thiserror::Error;

/// The socket never opened, or it went away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to open {url}: {message}")]
    Open { url: String, message: String },
    #[error("transport closed: {0}")]
    Closed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    Transport,
    Handshake,
}

impl ConnectStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Handshake => "handshake",
        }
    }
}

impl std::fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured `connect` rejection, code kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeRejection {
    pub code: HandshakeCode,
    pub raw_code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl From<ErrorShape> for HandshakeRejection {
    fn from(shape: ErrorShape) -> Self {
        Self {
            code: HandshakeCode::from_wire(&shape.code),
            raw_code: shape.code,
            message: shape.message,
            details: shape.details,
        }
    }
}

impl std::fmt::Display for HandshakeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.raw_code)
        } else {
            write!(f, "{}: {}", self.raw_code, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectError {
    #[error("invalid gateway url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{stage} timed out after {timeout:?}")]
    Timeout {
        stage: ConnectStage,
        timeout: Duration,
    },
    #[error("gateway rejected connect: {0}")]
    Rejected(HandshakeRejection),
    #[error("protocol violation during handshake: {0}")]
    ProtocolViolation(String),
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,
    #[error("connection attempt was abandoned")]
    Aborted,
}

impl ConnectError {
    /// Transport-level failures are the only ones that trigger scheme fallback.
    #[must_use]
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Timeout {
                    stage: ConnectStage::Transport,
                    ..
                }
        )
    }
}

/// Why a pending request was cancelled instead of resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    ConnectionLost(String),
    Closed,
    Explicit,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(reason) => write!(f, "connection lost ({reason})"),
            Self::Closed => f.write_str("connection closed"),
            Self::Explicit => f.write_str("cancelled by caller"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request {id} timed out after {timeout:?}")]
pub struct TimeoutError {
    pub id: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("request id {0} is already pending")]
    DuplicateId(String),
}

/// Failure of one logical request. Never tears down the connection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("not connected to the gateway")]
    NotConnected,
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("request {id} cancelled: {reason}")]
    Cancelled { id: String, reason: CancelReason },
    #[error("gateway error {0}")]
    Gateway(ErrorShape),
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("unexpected response payload: {0}")]
    Decode(String),
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

/// Connection-level failure as shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionFailure {
    Transport { message: String },
    Rejected(HandshakeRejection),
    Timeout { stage: ConnectStage },
    ProtocolViolation { reason: String },
    KeepaliveExpired { silent_for: Duration },
}

impl ConnectionFailure {
    /// Stable code; handshake rejections keep their gateway code.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Rejected(rejection) => rejection.code.as_str(),
            Self::Timeout { .. } => "timeout",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::KeepaliveExpired { .. } => "keepalive_expired",
        }
    }

    /// Rejections that new credentials or pairing must fix first.
    #[must_use]
    pub fn needs_user_action(&self) -> bool {
        matches!(self, Self::Rejected(rejection) if rejection.code.needs_user_action())
    }

    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport { .. } => {
                "Cannot reach the gateway. Check that it is running and the address is correct."
                    .to_string()
            }
            Self::Rejected(rejection) => match &rejection.code {
                HandshakeCode::Unauthorized | HandshakeCode::TokenMismatch => {
                    "The gateway rejected the access token. Update the token and retry.".to_string()
                }
                HandshakeCode::MissingIdentity => {
                    "The gateway needs a token or device identity to connect.".to_string()
                }
                HandshakeCode::PairingRequired => {
                    "Approve this device on the gateway, then retry.".to_string()
                }
                HandshakeCode::ProtocolMismatch => {
                    "The gateway speaks an incompatible protocol version. Update the app or the gateway."
                        .to_string()
                }
                HandshakeCode::Other(_) if !rejection.message.is_empty() => {
                    rejection.message.clone()
                }
                HandshakeCode::Other(code) => format!("The gateway refused the connection ({code})."),
            },
            Self::Timeout { stage } => format!("The gateway did not answer in time ({stage})."),
            Self::ProtocolViolation { .. } => {
                "The gateway sent data this app does not understand.".to_string()
            }
            Self::KeepaliveExpired { .. } => {
                "The connection went silent and will be re-established.".to_string()
            }
        }
    }
}

impl std::fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport { message } => write!(f, "transport: {message}"),
            Self::Rejected(rejection) => write!(f, "rejected: {rejection}"),
            Self::Timeout { stage } => write!(f, "{stage} timeout"),
            Self::ProtocolViolation { reason } => write!(f, "protocol violation: {reason}"),
            Self::KeepaliveExpired { silent_for } => {
                write!(f, "no frames for {silent_for:?}")
            }
        }
    }
}

impl From<&ConnectError> for ConnectionFailure {
    fn from(error: &ConnectError) -> Self {
        match error {
            ConnectError::Rejected(rejection) => Self::Rejected(rejection.clone()),
            ConnectError::Timeout { stage, .. } => Self::Timeout { stage: *stage },
            ConnectError::ProtocolViolation(reason) => Self::ProtocolViolation {
                reason: reason.clone(),
            },
            ConnectError::InvalidUrl { .. }
            | ConnectError::Transport(_)
            | ConnectError::AlreadyConnecting
            | ConnectError::Aborted => Self::Transport {
                message: error.to_string(),
            },
        }
    }
}
