//! `connect` request parameters and the `hello-ok` reply.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::DecodeError;

/// Protocol revision spoken by this client.
pub const PROTOCOL_VERSION: u32 = 3;

pub const DEFAULT_ROLE: &str = "operator";
pub const DEFAULT_SCOPES: &[&str] = &["operator.read", "operator.write"];

/// Parameters of the mandatory first request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caps: Vec<String>,
    pub auth: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl ConnectParams {
    pub fn new(client: ClientInfo, auth: Credentials) -> Self {
        let user_agent = Some(format!("{}/{}", client.id, client.version));
        Self {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client,
            role: DEFAULT_ROLE.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(ToString::to_string).collect(),
            caps: Vec::new(),
            auth,
            locale: None,
            user_agent,
        }
    }

    #[must_use]
    pub fn accepts(&self, version: u32) -> bool {
        (self.min_protocol..=self.max_protocol).contains(&version)
    }
}

/// Caller identity descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

impl ClientInfo {
    pub fn desktop(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            version: version.into(),
            platform: std::env::consts::OS.to_string(),
            mode: "ui".to_string(),
        }
    }
}

/// Credentials presented in `connect`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    Token {
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    Device {
        device_id: String,
        public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl Credentials {
    pub fn token(token: impl Into<String>) -> Self {
        Self::Token {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token { .. } => f
                .debug_struct("Token")
                .field("token", &"<redacted>")
                .finish(),
            Self::Device { device_id, .. } => f
                .debug_struct("Device")
                .field("device_id", device_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Successful `connect` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: u32,
    #[serde(default)]
    pub server: ServerInfo,
    #[serde(default)]
    pub features: ServerFeatures,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
    #[serde(default)]
    pub policy: HelloPolicy,
}

impl HelloOk {
    pub const KIND: &'static str = "hello-ok";

    pub fn parse(payload: Value) -> Result<Self, DecodeError> {
        let hello: Self =
            serde_json::from_value(payload).map_err(|error| DecodeError::Malformed {
                reason: format!("invalid hello-ok payload: {error}"),
            })?;
        if hello.kind != Self::KIND {
            return Err(DecodeError::Malformed {
                reason: format!("expected hello-ok payload, got `{}`", hello.kind),
            });
        }
        Ok(hello)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFeatures {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

impl ServerFeatures {
    #[must_use]
    pub fn supports_method(&self, method: &str) -> bool {
        self.methods.iter().any(|candidate| candidate == method)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

impl HelloPolicy {
    #[must_use]
    pub fn tick_interval(&self) -> Option<Duration> {
        self.tick_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Classified `connect` rejection code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandshakeCode {
    MissingIdentity,
    TokenMismatch,
    Unauthorized,
    PairingRequired,
    ProtocolMismatch,
    Other(String),
}

impl HandshakeCode {
    pub fn from_wire(code: &str) -> Self {
        let normalized = code.trim().to_ascii_uppercase().replace(['-', '.'], "_");
        match normalized.as_str() {
            "MISSING_IDENTITY" | "IDENTITY_REQUIRED" | "DEVICE_IDENTITY_REQUIRED" => {
                Self::MissingIdentity
            }
            "TOKEN_MISMATCH" | "INVALID_TOKEN" => Self::TokenMismatch,
            "UNAUTHORIZED" => Self::Unauthorized,
            "PAIRING_REQUIRED" | "NOT_PAIRED" => Self::PairingRequired,
            "PROTOCOL_MISMATCH" | "UNSUPPORTED_PROTOCOL" | "VERSION_MISMATCH" => {
                Self::ProtocolMismatch
            }
            _ => Self::Other(code.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::MissingIdentity => "missing_identity",
            Self::TokenMismatch => "token_mismatch",
            Self::Unauthorized => "unauthorized",
            Self::PairingRequired => "pairing_required",
            Self::ProtocolMismatch => "protocol_mismatch",
            Self::Other(code) => code.as_str(),
        }
    }

    /// True when only new user input (token, pairing) can fix the rejection.
    #[must_use]
    pub fn needs_user_action(&self) -> bool {
        matches!(
            self,
            Self::MissingIdentity | Self::TokenMismatch | Self::Unauthorized | Self::PairingRequired
        )
    }
}

impl std::fmt::Display for HandshakeCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
