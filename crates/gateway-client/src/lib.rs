//! Gateway client.
//!
//! [`GatewayConnection`] owns one transport at a time, performs the `connect`
//! handshake, correlates requests with responses, and fans pushed events out
//! through an [`EventDispatcher`]. [`ReconnectSupervisor`] watches its
//! lifecycle signals and drives reconnect attempts along a fixed backoff
//! ladder.

#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

pub mod connection;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod memory;
pub mod supervisor;
pub mod transport;

pub use connection::{
    ConnectionConfig, ConnectionState, GatewayConnection, LifecycleSignal, ProtocolSession,
    SchemeFallback, SchemeSwitch, SessionPolicy,
};
pub use correlation::{CompletionHandle, CorrelationTable};
pub use dispatcher::{ALL_EVENTS, EventDispatcher, StreamTracker, Subscription};
pub use error::{
    CancelReason, ConnectError, ConnectStage, ConnectionFailure, CorrelationError,
    HandshakeRejection, RequestError, TimeoutError, TransportError,
};
pub use health::{ConnectionQuality, HealthMetrics};
pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};
pub use supervisor::{
    BackoffLadder, ReconnectMachine, ReconnectState, ReconnectSupervisor, SupervisorPhase,
    SupervisorStatus,
};
pub use transport::{Connector, Inbound, TransportLink, WebSocketConnector, normalize_gateway_url};

pub use openagents_gateway_proto as proto;
