//! In-process transport.
//!
//! [`MemoryConnector`] hands every accepted link to a [`MemoryListener`], whose
//! [`MemoryPeer`]s play the gateway side. Used by the integration tests and by
//! embedders that run a gateway in the same process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use openagents_gateway_proto::{
    CONNECT_METHOD, ErrorShape, EventFrame, Frame, RequestFrame, ResponseFrame, decode, encode,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use url::Url;

use crate::error::TransportError;
use crate::transport::{Connector, Inbound, TransportLink};

/// How `open` treats one URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Refuse,
    Hang,
}

#[derive(Default)]
struct ConnectorState {
    behaviors: HashMap<String, Behavior>,
    attempts: VecDeque<Url>,
}

#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
    accepted: mpsc::UnboundedSender<MemoryPeer>,
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector").finish_non_exhaustive()
    }
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryListener) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(Mutex::new(ConnectorState::default())),
                accepted,
            },
            MemoryListener { incoming },
        )
    }

    fn state(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail `open` for this URL at the transport level.
    pub fn refuse(&self, url: &str) {
        self.set_behavior(url, Behavior::Refuse);
    }

    /// Never complete `open` for this URL.
    pub fn hang(&self, url: &str) {
        self.set_behavior(url, Behavior::Hang);
    }

    pub fn allow(&self, url: &str) {
        if let Ok(url) = Url::parse(url) {
            self.state().behaviors.remove(url.as_str());
        }
    }

    fn set_behavior(&self, url: &str, behavior: Behavior) {
        if let Ok(url) = Url::parse(url) {
            self.state().behaviors.insert(url.to_string(), behavior);
        }
    }

    /// Every URL `open` was called with, oldest first.
    #[must_use]
    pub fn attempts(&self) -> Vec<Url> {
        self.state().attempts.iter().cloned().collect()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, url: &Url) -> Result<TransportLink, TransportError> {
        let behavior = {
            let mut state = self.state();
            state.attempts.push_back(url.clone());
            state.behaviors.get(url.as_str()).copied()
        };
        match behavior {
            Some(Behavior::Refuse) => {
                return Err(TransportError::Open {
                    url: url.to_string(),
                    message: "connection refused".to_string(),
                });
            }
            Some(Behavior::Hang) => std::future::pending::<()>().await,
            None => {}
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            url: url.clone(),
            to_client,
            from_client,
        };
        self.accepted
            .send(peer)
            .map_err(|_| TransportError::Open {
                url: url.to_string(),
                message: "listener dropped".to_string(),
            })?;
        Ok(TransportLink { outbound, inbound })
    }
}

#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }
}

/// Gateway side of one in-memory link.
#[derive(Debug)]
pub struct MemoryPeer {
    pub url: Url,
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Next text frame from the client, `None` once it hung up.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next decodable request from the client.
    pub async fn recv_request(&mut self) -> Option<RequestFrame> {
        while let Some(text) = self.recv_text().await {
            if let Ok(Frame::Request(request)) = decode(&text) {
                return Some(request);
            }
        }
        None
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Inbound::Text(text.into())).is_ok()
    }

    pub fn send_frame(&self, frame: &Frame) -> bool {
        match encode(frame) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    pub fn send_event(&self, name: &str, payload: Value) -> bool {
        self.send_frame(&Frame::Event(EventFrame::new(name, payload)))
    }

    pub fn respond(&self, id: &str, payload: Value) -> bool {
        self.send_frame(&Frame::Response(ResponseFrame::success(id, payload)))
    }

    pub fn respond_error(&self, id: &str, code: &str, message: &str) -> bool {
        self.send_frame(&Frame::Response(ResponseFrame::failure(
            id,
            ErrorShape::new(code, message),
        )))
    }

    /// Read the `connect` request and accept it with a `hello-ok`.
    pub async fn accept_handshake(&mut self, tick_interval_ms: u64) -> Option<RequestFrame> {
        let request = self.recv_request().await?;
        if request.method != CONNECT_METHOD {
            return None;
        }
        self.respond(
            &request.id,
            json!({
                "type": "hello-ok",
                "protocol": 3,
                "server": {"version": "memory", "connId": "memory-1"},
                "features": {"methods": ["chat.send", "models.list"], "events": ["chat", "tick"]},
                "policy": {"tickIntervalMs": tick_interval_ms}
            }),
        );
        Some(request)
    }

    /// Read the `connect` request and reject it with `code`.
    pub async fn reject_handshake(&mut self, code: &str, message: &str) -> Option<RequestFrame> {
        let request = self.recv_request().await?;
        self.respond_error(&request.id, code, message);
        Some(request)
    }

    pub fn close(&self, reason: &str) {
        let _ = self.to_client.send(Inbound::Closed {
            reason: reason.to_string(),
        });
    }
}
