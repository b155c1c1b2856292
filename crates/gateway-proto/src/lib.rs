//! Gateway wire protocol.
//!
//! Three frame kinds travel as JSON text: `req`, `res`, and `event`. This crate
//! is stateless; it only turns text into typed frames and back. Connection
//! state lives in `openagents-gateway-client`.

#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

pub mod event;
pub mod frame;
pub mod handshake;

pub use event::{ChatContent, ChatEvent, ChatMessage, ChatState, GatewayEvent, TokenUsage};
pub use frame::{
    DecodeError, ErrorShape, EventFrame, Frame, RequestFrame, ResponseFrame, decode, encode,
};
pub use handshake::{
    ClientInfo, ConnectParams, Credentials, HandshakeCode, HelloOk, HelloPolicy, PROTOCOL_VERSION,
    ServerFeatures, ServerInfo,
};

/// Request method that opens every session.
pub const CONNECT_METHOD: &str = "connect";
/// Event the Gateway may send before the `connect` response.
pub const CONNECT_CHALLENGE_EVENT: &str = "connect.challenge";
