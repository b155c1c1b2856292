//! Gateway connection manager.
//!
//! One [`GatewayConnection`] owns at most one transport. Transitions are
//! published on a `watch` channel (current state) and a `broadcast` channel
//! (lifecycle signals for the supervisor and UI). Every attempt carries an
//! epoch; `close()` bumps it, which turns any attempt still in flight into a
//! no-op when it finishes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use openagents_gateway_proto::event::CONNECTION_LOST_EVENT;
use openagents_gateway_proto::{
    CONNECT_CHALLENGE_EVENT, CONNECT_METHOD, ClientInfo, ConnectParams, Credentials, DecodeError,
    Frame, GatewayEvent, HelloOk, RequestFrame, ResponseFrame, ServerFeatures, decode, encode,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::correlation::{CorrelationTable, DEFAULT_REQUEST_TIMEOUT};
use crate::dispatcher::{EventDispatcher, StreamTracker, Subscription};
use crate::error::{
    CancelReason, ConnectError, ConnectStage, ConnectionFailure, HandshakeRejection,
    RequestError, TransportError,
};
use crate::health::{ConnectionQuality, HealthMetrics};
use crate::transport::{Connector, Inbound, TransportLink, alternate_scheme, normalize_gateway_url};

const LIFECYCLE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Closing,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closing => "closing",
        }
    }

    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Which scheme switches are tried after a transport-level failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemeFallback {
    /// `wss` to `ws` and `ws` to `wss`.
    #[default]
    Bidirectional,
    /// Only `ws` to `wss`; never downgrade.
    UpgradeOnly,
    Disabled,
}

impl SchemeFallback {
    #[must_use]
    pub fn alternate(self, url: &Url) -> Option<Url> {
        match self {
            Self::Disabled => None,
            Self::UpgradeOnly if url.scheme() != "ws" => None,
            Self::Bidirectional | Self::UpgradeOnly => alternate_scheme(url),
        }
    }
}

impl std::str::FromStr for SchemeFallback {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bidirectional" | "both" => Ok(Self::Bidirectional),
            "upgrade_only" | "upgrade-only" | "upgrade" => Ok(Self::UpgradeOnly),
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            other => Err(format!("unknown scheme fallback policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub client: ClientInfo,
    pub locale: Option<String>,
    pub caps: Vec<String>,
    pub request_timeout: Duration,
    /// Bound on opening one transport (each scheme attempt separately).
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Used when `hello-ok` carries no tick interval.
    pub default_keepalive_interval: Duration,
    /// Silence longer than `interval * grace` marks the link stale.
    pub keepalive_grace: u32,
    pub stream_timeout: Duration,
    pub stream_check_interval: Duration,
    pub scheme_fallback: SchemeFallback,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client: ClientInfo::desktop("openagents-desktop", env!("CARGO_PKG_VERSION")),
            locale: None,
            caps: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
            default_keepalive_interval: Duration::from_secs(30),
            keepalive_grace: 2,
            stream_timeout: Duration::from_secs(60),
            stream_check_interval: Duration::from_secs(5),
            scheme_fallback: SchemeFallback::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeSwitch {
    pub from: Url,
    pub to: Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub keepalive_interval: Duration,
    pub max_payload: Option<u64>,
}

/// Result of one successful handshake. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolSession {
    pub negotiated_version: u32,
    pub server_version: String,
    pub connection_id: Option<String>,
    pub server_features: ServerFeatures,
    /// The URL that actually worked, scheme included.
    pub transport_url: Url,
    pub scheme_fallback: Option<SchemeSwitch>,
    pub policy: SessionPolicy,
    pub snapshot: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum LifecycleSignal {
    Ready(Arc<ProtocolSession>),
    Lost { failure: ConnectionFailure },
    /// Manual close; not a failure.
    Closed,
}

struct ActiveLink {
    epoch: u64,
    outbound: tokio::sync::mpsc::UnboundedSender<String>,
    session: Arc<ProtocolSession>,
    reader: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    epoch: u64,
    link: Option<ActiveLink>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    correlation: Arc<CorrelationTable>,
    dispatcher: EventDispatcher,
    state: watch::Sender<ConnectionState>,
    lifecycle: broadcast::Sender<LifecycleSignal>,
    control: Mutex<Control>,
    health: Mutex<HealthMetrics>,
    streams: Mutex<StreamTracker>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let control = self
            .control
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = control.link.take() {
            link.reader.abort();
            link.monitor.abort();
        }
    }
}

enum Attempt {
    Ready(Arc<ProtocolSession>),
    Started(u64),
}

#[derive(Clone)]
pub struct GatewayConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GatewayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConnection")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl GatewayConnection {
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                correlation: Arc::new(CorrelationTable::new(config.request_timeout)),
                config,
                connector,
                dispatcher: EventDispatcher::new(),
                state,
                lifecycle,
                control: Mutex::new(Control::default()),
                health: Mutex::new(HealthMetrics::default()),
                streams: Mutex::new(StreamTracker::default()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleSignal> {
        self.inner.lifecycle.subscribe()
    }

    #[must_use]
    pub fn session(&self) -> Option<Arc<ProtocolSession>> {
        self.inner
            .control()
            .link
            .as_ref()
            .map(|link| Arc::clone(&link.session))
    }

    #[must_use]
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        self.inner.dispatcher.subscribe(name)
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.correlation.len()
    }

    /// Snapshot of request latency and failure counts for this link.
    #[must_use]
    pub fn health(&self) -> HealthMetrics {
        self.inner.health().clone()
    }

    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        self.inner.health().quality()
    }

    #[must_use]
    pub fn average_latency(&self) -> Option<Duration> {
        self.inner.health().average_latency()
    }

    /// Open a transport, run the handshake, and enter `Ready`.
    ///
    /// Already `Ready` returns the current session.
    pub async fn connect(
        &self,
        url: &str,
        credentials: Credentials,
    ) -> Result<Arc<ProtocolSession>, ConnectError> {
        let url = normalize_gateway_url(url)?;
        let epoch = match self.inner.begin_attempt()? {
            Attempt::Ready(session) => return Ok(session),
            Attempt::Started(epoch) => epoch,
        };
        info!(%url, epoch, "connecting to gateway");

        match self.establish(epoch, url, credentials).await {
            Ok(session) => Ok(session),
            Err(error) => {
                self.inner.abandon_attempt(epoch);
                match &error {
                    ConnectError::Rejected(rejection) => warn!(
                        target: "openagents.gateway",
                        code = %rejection.raw_code,
                        message = %rejection.message,
                        "gateway rejected connect"
                    ),
                    other => warn!(target: "openagents.gateway", error = %other, "gateway connect failed"),
                }
                Err(error)
            }
        }
    }

    async fn establish(
        &self,
        epoch: u64,
        url: Url,
        credentials: Credentials,
    ) -> Result<Arc<ProtocolSession>, ConnectError> {
        let (mut link, transport_url, scheme_fallback) = self.open_with_fallback(&url).await?;
        if !self.inner.transition(epoch, ConnectionState::Handshaking) {
            return Err(ConnectError::Aborted);
        }

        let hello = self.handshake(&mut link, credentials).await?;

        let session = Arc::new(ProtocolSession {
            negotiated_version: hello.protocol,
            server_version: hello.server.version,
            connection_id: hello.server.conn_id,
            server_features: hello.features,
            transport_url,
            scheme_fallback,
            policy: SessionPolicy {
                keepalive_interval: hello
                    .policy
                    .tick_interval()
                    .unwrap_or(self.inner.config.default_keepalive_interval),
                max_payload: hello.policy.max_payload,
            },
            snapshot: hello.snapshot,
        });

        self.inner.install(epoch, link, Arc::clone(&session))?;
        info!(
            url = %session.transport_url,
            protocol = session.negotiated_version,
            server = %session.server_version,
            "gateway connection ready"
        );
        let _ = self
            .inner
            .lifecycle
            .send(LifecycleSignal::Ready(Arc::clone(&session)));
        Ok(session)
    }

    async fn open_with_fallback(
        &self,
        url: &Url,
    ) -> Result<(TransportLink, Url, Option<SchemeSwitch>), ConnectError> {
        let primary = match self.open_once(url).await {
            Ok(link) => return Ok((link, url.clone(), None)),
            Err(error) if error.is_transport_level() => error,
            Err(error) => return Err(error),
        };
        let Some(alternate) = self.inner.config.scheme_fallback.alternate(url) else {
            return Err(primary);
        };
        warn!(
            target: "openagents.gateway",
            from = %url,
            to = %alternate,
            error = %primary,
            "transport failed; retrying once with alternate scheme"
        );
        match self.open_once(&alternate).await {
            Ok(link) => Ok((
                link,
                alternate.clone(),
                Some(SchemeSwitch {
                    from: url.clone(),
                    to: alternate,
                }),
            )),
            Err(fallback) => {
                debug!(error = %fallback, "alternate scheme failed too");
                Err(primary)
            }
        }
    }

    async fn open_once(&self, url: &Url) -> Result<TransportLink, ConnectError> {
        let connect_timeout = self.inner.config.connect_timeout;
        timeout(connect_timeout, self.inner.connector.open(url))
            .await
            .map_err(|_| ConnectError::Timeout {
                stage: ConnectStage::Transport,
                timeout: connect_timeout,
            })?
            .map_err(ConnectError::from)
    }

    fn connect_params(&self, credentials: Credentials) -> ConnectParams {
        let config = &self.inner.config;
        let mut params = ConnectParams::new(config.client.clone(), credentials);
        params.caps.clone_from(&config.caps);
        params.locale.clone_from(&config.locale);
        params
    }

    async fn handshake(
        &self,
        link: &mut TransportLink,
        credentials: Credentials,
    ) -> Result<HelloOk, ConnectError> {
        let id = Uuid::new_v4().to_string();
        let params = self.connect_params(credentials);
        let body = serde_json::to_value(&params)
            .map_err(|error| ConnectError::ProtocolViolation(error.to_string()))?;
        let text = encode(&Frame::Request(RequestFrame::new(&id, CONNECT_METHOD, body)))
            .map_err(|error| ConnectError::ProtocolViolation(error.to_string()))?;
        link.outbound.send(text).map_err(|_| {
            TransportError::Closed("transport closed before handshake".to_string())
        })?;

        let handshake_timeout = self.inner.config.handshake_timeout;
        let hello = timeout(handshake_timeout, await_hello(link, &id))
            .await
            .map_err(|_| ConnectError::Timeout {
                stage: ConnectStage::Handshake,
                timeout: handshake_timeout,
            })??;
        if !params.accepts(hello.protocol) {
            return Err(ConnectError::ProtocolViolation(format!(
                "gateway negotiated unsupported protocol {}",
                hello.protocol
            )));
        }
        Ok(hello)
    }

    /// Send a request and wait for its response payload.
    ///
    /// Fails with [`RequestError::NotConnected`] outside `Ready`; nothing is
    /// queued at this layer.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value, RequestError> {
        self.send_with_timeout(method, params, self.inner.config.request_timeout)
            .await
    }

    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Value,
        request_timeout: Duration,
    ) -> Result<Value, RequestError> {
        let id = Uuid::new_v4().to_string();
        // Registered under the control lock so a teardown either sees the
        // entry in `cancel_all` or has already removed the link.
        let (outbound, handle) = {
            let control = self.inner.control();
            let outbound = control
                .link
                .as_ref()
                .map(|link| link.outbound.clone())
                .ok_or(RequestError::NotConnected)?;
            let handle = self
                .inner
                .correlation
                .register_with_timeout(&id, request_timeout)?;
            (outbound, handle)
        };
        let text = encode(&Frame::Request(RequestFrame::new(&id, method, params)))
            .map_err(|error| RequestError::Encode(error.to_string()))?;
        if outbound.send(text).is_err() {
            return Err(RequestError::NotConnected);
        }
        debug!(%method, %id, "sent gateway request");

        let response = match handle.wait().await {
            Ok(response) => response,
            Err(error) => {
                if matches!(error, RequestError::Timeout(_)) {
                    self.inner.health().record_failure();
                }
                return Err(error);
            }
        };
        response.into_result().map_err(RequestError::Gateway)
    }

    /// Typed variant of [`send`](Self::send).
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R, RequestError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params =
            serde_json::to_value(params).map_err(|error| RequestError::Encode(error.to_string()))?;
        let payload = self.send(method, params).await?;
        serde_json::from_value(payload).map_err(|error| RequestError::Decode(error.to_string()))
    }

    /// Close the connection on purpose. Not reported as a failure.
    pub fn close(&self) {
        self.inner.close();
    }
}

async fn await_hello(link: &mut TransportLink, id: &str) -> Result<HelloOk, ConnectError> {
    loop {
        let Some(inbound) = link.inbound.recv().await else {
            return Err(TransportError::Closed("transport closed during handshake".to_string()).into());
        };
        let text = match inbound {
            Inbound::Text(text) => text,
            Inbound::Closed { reason } => return Err(TransportError::Closed(reason).into()),
            Inbound::Failed { error } => return Err(TransportError::Closed(error).into()),
        };
        match decode(&text) {
            Ok(Frame::Response(response)) if response.id == id => {
                return match response.into_result() {
                    Ok(payload) => HelloOk::parse(payload)
                        .map_err(|error| ConnectError::ProtocolViolation(error.to_string())),
                    Err(shape) => Err(ConnectError::Rejected(HandshakeRejection::from(shape))),
                };
            }
            Ok(Frame::Event(event)) if event.name == CONNECT_CHALLENGE_EVENT => {
                debug!("ignoring connect challenge received before connect response");
            }
            Ok(frame) => {
                return Err(ConnectError::ProtocolViolation(format!(
                    "unexpected {} frame before connect response",
                    frame.kind()
                )));
            }
            Err(DecodeError::UnknownFrame { tag }) => {
                warn!(target: "openagents.gateway", %tag, "discarding unknown frame during handshake");
            }
            Err(error @ DecodeError::Malformed { .. }) => {
                return Err(ConnectError::ProtocolViolation(error.to_string()));
            }
        }
    }
}

impl Inner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn health(&self) -> MutexGuard<'_, HealthMetrics> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn streams(&self) -> MutexGuard<'_, StreamTracker> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_attempt(&self) -> Result<Attempt, ConnectError> {
        let mut control = self.control();
        if let Some(link) = control.link.as_ref() {
            return Ok(Attempt::Ready(Arc::clone(&link.session)));
        }
        if matches!(
            *self.state.borrow(),
            ConnectionState::Connecting | ConnectionState::Handshaking
        ) {
            return Err(ConnectError::AlreadyConnecting);
        }
        control.epoch += 1;
        self.state.send_replace(ConnectionState::Connecting);
        Ok(Attempt::Started(control.epoch))
    }

    fn transition(&self, epoch: u64, state: ConnectionState) -> bool {
        let control = self.control();
        if control.epoch != epoch {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    fn abandon_attempt(&self, epoch: u64) {
        let control = self.control();
        if control.epoch == epoch && control.link.is_none() {
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }

    fn install(
        self: &Arc<Self>,
        epoch: u64,
        link: TransportLink,
        session: Arc<ProtocolSession>,
    ) -> Result<(), ConnectError> {
        let mut control = self.control();
        if control.epoch != epoch {
            return Err(ConnectError::Aborted);
        }
        let keepalive_window = session
            .policy
            .keepalive_interval
            .saturating_mul(self.config.keepalive_grace.max(1));
        let TransportLink { outbound, inbound } = link;
        let reader = tokio::spawn(run_reader(
            Arc::downgrade(self),
            epoch,
            inbound,
            keepalive_window,
        ));
        let monitor = tokio::spawn(monitor_streams(
            Arc::downgrade(self),
            self.config.stream_check_interval,
            self.config.stream_timeout,
        ));
        control.link = Some(ActiveLink {
            epoch,
            outbound,
            session,
            reader,
            monitor,
        });
        self.health().reset();
        self.streams().clear();
        self.state.send_replace(ConnectionState::Ready);
        Ok(())
    }

    /// Route one frame received while `Ready`. `Err` carries the
    /// protocol-violation reason.
    fn route_frame(&self, text: &str) -> Result<(), String> {
        match decode(text) {
            Ok(Frame::Response(response)) => {
                // Track before resolving so the run's own events, which the
                // reader routes next, can end it.
                if let Some(run_id) = started_run(&response) {
                    self.streams().begin(run_id, Instant::now());
                }
                let id = response.id.clone();
                if let Some(latency) = self.correlation.resolve(&id, response) {
                    self.health().record_latency(latency);
                }
                Ok(())
            }
            Ok(Frame::Event(frame)) => {
                let event = GatewayEvent::from_frame(frame);
                self.streams().observe(&event, Instant::now());
                self.dispatcher.dispatch(&event);
                Ok(())
            }
            Ok(Frame::Request(request)) => Err(format!(
                "gateway sent a request frame (`{}`)",
                request.method
            )),
            Err(DecodeError::UnknownFrame { tag }) => {
                warn!(target: "openagents.gateway", %tag, "discarding unknown frame");
                Ok(())
            }
            Err(DecodeError::Malformed { reason }) => Err(format!("malformed frame: {reason}")),
        }
    }

    /// Leave `Ready` after a failure. Only the owning epoch may tear down.
    fn teardown(&self, epoch: u64, failure: ConnectionFailure) {
        let link = {
            let mut control = self.control();
            match control.link.as_ref() {
                Some(link) if link.epoch == epoch => control.link.take(),
                _ => None,
            }
        };
        let Some(link) = link else {
            return;
        };
        link.monitor.abort();
        drop(link.outbound);

        let reason = failure.to_string();
        let cancelled = self
            .correlation
            .cancel_all(&CancelReason::ConnectionLost(reason.clone()));
        self.streams().clear();
        self.dispatcher.dispatch(&GatewayEvent::ConnectionLost {
            reason: reason.clone(),
        });
        self.transition(epoch, ConnectionState::Disconnected);
        warn!(
            target: "openagents.gateway",
            %reason,
            cancelled,
            event = CONNECTION_LOST_EVENT,
            "gateway connection lost"
        );
        let _ = self.lifecycle.send(LifecycleSignal::Lost { failure });
    }

    fn close(&self) {
        let link = {
            let mut control = self.control();
            control.epoch += 1;
            let state = *self.state.borrow();
            if control.link.is_none() && state == ConnectionState::Disconnected {
                return;
            }
            self.state.send_replace(ConnectionState::Closing);
            control.link.take()
        };
        if let Some(link) = link {
            link.reader.abort();
            link.monitor.abort();
        }
        let cancelled = self.correlation.cancel_all(&CancelReason::Closed);
        self.streams().clear();
        self.state.send_replace(ConnectionState::Disconnected);
        info!(cancelled, "gateway connection closed");
        let _ = self.lifecycle.send(LifecycleSignal::Closed);
    }
}

fn started_run(response: &ResponseFrame) -> Option<&str> {
    if !response.ok {
        return None;
    }
    response.payload.as_ref()?.get("runId")?.as_str()
}

async fn run_reader(
    inner: Weak<Inner>,
    epoch: u64,
    mut inbound: tokio::sync::mpsc::UnboundedReceiver<Inbound>,
    keepalive_window: Duration,
) {
    let mut deadline = Instant::now() + keepalive_window;
    let failure = loop {
        tokio::select! {
            next = inbound.recv() => {
                let Some(next) = next else {
                    break ConnectionFailure::Transport { message: "transport closed".to_string() };
                };
                match next {
                    Inbound::Text(text) => {
                        deadline = Instant::now() + keepalive_window;
                        let Some(inner) = inner.upgrade() else {
                            return;
                        };
                        if let Err(reason) = inner.route_frame(&text) {
                            break ConnectionFailure::ProtocolViolation { reason };
                        }
                    }
                    Inbound::Closed { reason } => {
                        break ConnectionFailure::Transport { message: format!("closed: {reason}") };
                    }
                    Inbound::Failed { error } => {
                        break ConnectionFailure::Transport { message: error };
                    }
                }
            }
            () = tokio::time::sleep_until(deadline) => {
                break ConnectionFailure::KeepaliveExpired { silent_for: keepalive_window };
            }
        }
    };
    if let Some(inner) = inner.upgrade() {
        inner.teardown(epoch, failure);
    }
}

async fn monitor_streams(inner: Weak<Inner>, check_interval: Duration, stream_timeout: Duration) {
    let mut interval = tokio::time::interval(check_interval.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let expired = inner.streams().take_expired(Instant::now(), stream_timeout);
        for (run_id, idle) in expired {
            warn!(
                target: "openagents.gateway",
                %run_id,
                idle_ms = idle.as_millis(),
                "chat stream went quiet; synthesizing timeout"
            );
            inner.dispatcher.dispatch(&GatewayEvent::StreamTimeout {
                run_id,
                idle_ms: u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
            });
        }
    }
}
