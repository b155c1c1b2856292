//! Frame codec.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One unit of wire traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl Frame {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "req",
            Self::Response(_) => "res",
            Self::Event(_) => "event",
        }
    }
}

/// Client-initiated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Reply to exactly one request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Split into payload or structured error.
    ///
    /// A success without payload yields `Value::Null`; a failure without an
    /// error body yields code `UNKNOWN`.
    pub fn into_result(self) -> Result<Value, ErrorShape> {
        if self.ok {
            return Ok(self.payload.unwrap_or(Value::Null));
        }
        Err(self.error.unwrap_or_else(|| {
            ErrorShape::new("UNKNOWN", "gateway returned ok=false without an error body")
        }))
    }
}

/// Server-initiated, unsolicited event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            seq: None,
        }
    }
}

/// Structured error carried by `res` frames with `ok: false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

const REAUTH_CODES: &[&str] = &[
    "UNAUTHORIZED",
    "FORBIDDEN",
    "TOKEN_EXPIRED",
    "INVALID_TOKEN",
    "TOKEN_MISMATCH",
    "MISSING_IDENTITY",
    "PAIRING_REQUIRED",
];

const RETRYABLE_CODES: &[&str] = &[
    "RATE_LIMITED",
    "SERVICE_UNAVAILABLE",
    "TIMEOUT",
    "INTERNAL_ERROR",
];

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
        }
    }

    fn normalized_code(&self) -> String {
        self.code.trim().to_ascii_uppercase().replace(['-', '.'], "_")
    }

    /// True when repeating the same request later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        if let Some(retryable) = self.retryable {
            return retryable;
        }
        RETRYABLE_CODES.contains(&self.normalized_code().as_str())
    }

    /// True when the user has to supply new credentials or pair the device.
    #[must_use]
    pub fn requires_reauth(&self) -> bool {
        REAUTH_CODES.contains(&self.normalized_code().as_str())
    }

    /// Short human-readable text for a status banner.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self.normalized_code().as_str() {
            "UNAUTHORIZED" | "INVALID_TOKEN" | "TOKEN_MISMATCH" => {
                "The gateway rejected the access token. Check the token and reconnect.".to_string()
            }
            "TOKEN_EXPIRED" => "The access token has expired. Sign in again.".to_string(),
            "FORBIDDEN" => "This client is not allowed to perform that action.".to_string(),
            "MISSING_IDENTITY" => "The gateway requires a client identity or token.".to_string(),
            "PAIRING_REQUIRED" => {
                "This device must be paired with the gateway before it can connect.".to_string()
            }
            "RATE_LIMITED" => "Too many requests. Wait a moment and try again.".to_string(),
            "SERVICE_UNAVAILABLE" => "The gateway is temporarily unavailable.".to_string(),
            _ if self.message.is_empty() => format!("Gateway error ({})", self.code),
            _ => self.message.clone(),
        }
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// Failure to turn wire text into a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Well-formed frame with a tag this client does not understand.
    #[error("unknown frame type `{tag}`")]
    UnknownFrame { tag: String },
    /// Structurally invalid input; a protocol violation.
    #[error("malformed frame: {reason}")]
    Malformed { reason: String },
}

impl DecodeError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Serialize a frame as wire text.
pub fn encode(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Parse wire text into a typed frame.
pub fn decode(text: &str) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|error| DecodeError::malformed(format!("invalid JSON: {error}")))?;
    let tag = match value.get("type") {
        _ if !value.is_object() => {
            return Err(DecodeError::malformed("frame is not a JSON object"));
        }
        Some(Value::String(tag)) => tag.clone(),
        Some(_) => return Err(DecodeError::malformed("frame type is not a string")),
        None => return Err(DecodeError::malformed("frame is missing its type tag")),
    };

    match tag.as_str() {
        "req" => {
            let frame: RequestFrame = body(value, "req")?;
            require_non_empty(&frame.id, "req id")?;
            require_non_empty(&frame.method, "req method")?;
            Ok(Frame::Request(frame))
        }
        "res" => {
            let frame: ResponseFrame = body(value, "res")?;
            require_non_empty(&frame.id, "res id")?;
            Ok(Frame::Response(frame))
        }
        "event" => {
            let frame: EventFrame = body(value, "event")?;
            require_non_empty(&frame.name, "event name")?;
            Ok(Frame::Event(frame))
        }
        _ => Err(DecodeError::UnknownFrame { tag }),
    }
}

fn body<T: DeserializeOwned>(value: Value, tag: &str) -> Result<T, DecodeError> {
    serde_json::from_value(value)
        .map_err(|error| DecodeError::malformed(format!("invalid {tag} frame: {error}")))
}

fn require_non_empty(value: &str, field: &str) -> Result<(), DecodeError> {
    if value.trim().is_empty() {
        return Err(DecodeError::malformed(format!("{field} is empty")));
    }
    Ok(())
}
