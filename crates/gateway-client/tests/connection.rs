#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use openagents_gateway_client::proto::{
    Credentials, Frame, GatewayEvent, HandshakeCode, RequestFrame,
};
use openagents_gateway_client::{
    CancelReason, ConnectError, ConnectStage, ConnectionConfig, ConnectionFailure,
    ConnectionState, GatewayConnection, LifecycleSignal, MemoryConnector, MemoryListener,
    MemoryPeer, RequestError, SchemeFallback,
};
use serde_json::json;

const GATEWAY: &str = "ws://gateway.test:18789";

fn connection(connector: &MemoryConnector, config: ConnectionConfig) -> GatewayConnection {
    GatewayConnection::new(Arc::new(connector.clone()), config)
}

/// Connect and return the gateway side of the accepted link.
async fn connect_ready(
    connection: &GatewayConnection,
    listener: &mut MemoryListener,
    tick_interval_ms: u64,
) -> Result<MemoryPeer> {
    let client = connection.clone();
    let attempt =
        tokio::spawn(async move { client.connect(GATEWAY, Credentials::token("secret")).await });
    let mut peer = listener.accept().await.expect("transport opened");
    peer.accept_handshake(tick_interval_ms)
        .await
        .expect("connect request");
    attempt.await??;
    Ok(peer)
}

async fn next_lost(lifecycle: &mut tokio::sync::broadcast::Receiver<LifecycleSignal>) -> ConnectionFailure {
    loop {
        match lifecycle.recv().await.expect("lifecycle open") {
            LifecycleSignal::Lost { failure } => return failure,
            LifecycleSignal::Ready(_) | LifecycleSignal::Closed => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn handshake_sends_connect_first_and_negotiates_session() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    let connection = connection(&connector, ConnectionConfig::default());

    let gateway = tokio::spawn(async move {
        let mut peer = listener.accept().await.expect("transport opened");
        let first = peer.recv_text().await.expect("first frame");
        let Ok(Frame::Request(request)) = openagents_gateway_client::proto::decode(&first) else {
            panic!("first frame must be a request: {first}");
        };
        peer.respond(
            &request.id,
            json!({
                "type": "hello-ok",
                "protocol": 3,
                "server": {"version": "2026.10.1", "connId": "c-42"},
                "features": {"methods": ["chat.send"], "events": ["chat"]},
                "policy": {"tickIntervalMs": 15_000, "maxPayload": 1_048_576}
            }),
        );
        (peer, request)
    });

    let session = connection
        .connect(GATEWAY, Credentials::token("secret"))
        .await?;
    let (_peer, request) = gateway.await?;

    assert_eq!(request.method, "connect");
    assert_eq!(request.params["minProtocol"], 3);
    assert_eq!(request.params["maxProtocol"], 3);
    assert_eq!(request.params["auth"]["token"], "secret");
    assert_eq!(request.params["role"], "operator");

    assert_eq!(session.negotiated_version, 3);
    assert_eq!(session.server_version, "2026.10.1");
    assert_eq!(session.connection_id.as_deref(), Some("c-42"));
    assert!(session.server_features.supports_method("chat.send"));
    assert_eq!(session.policy.keepalive_interval, Duration::from_secs(15));
    assert_eq!(session.policy.max_payload, Some(1_048_576));
    assert!(session.scheme_fallback.is_none());
    assert_eq!(connection.state(), ConnectionState::Ready);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rejection_surfaces_specific_code() -> Result<()> {
    let cases = [
        ("UNAUTHORIZED", HandshakeCode::Unauthorized),
        ("PAIRING_REQUIRED", HandshakeCode::PairingRequired),
        ("TOKEN_MISMATCH", HandshakeCode::TokenMismatch),
        ("MISSING_IDENTITY", HandshakeCode::MissingIdentity),
    ];
    for (wire, expected) in cases {
        let (connector, mut listener) = MemoryConnector::new();
        let connection = connection(&connector, ConnectionConfig::default());
        let gateway = tokio::spawn(async move {
            let mut peer = listener.accept().await.expect("transport opened");
            peer.reject_handshake(wire, "no").await.expect("connect request");
            peer
        });

        let error = connection
            .connect(GATEWAY, Credentials::token("wrong"))
            .await
            .expect_err("rejected");
        let _peer = gateway.await?;
        let ConnectError::Rejected(rejection) = error else {
            panic!("expected rejection for {wire}, got {error:?}");
        };
        assert_eq!(rejection.code, expected);
        assert_eq!(rejection.raw_code, wire);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn secure_failure_falls_back_to_plain_scheme_once() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    connector.refuse("wss://gateway.test:18789/");
    let connection = connection(&connector, ConnectionConfig::default());

    let gateway = tokio::spawn(async move {
        let mut peer = listener.accept().await.expect("transport opened");
        peer.accept_handshake(30_000).await.expect("connect request");
        peer
    });
    let session = connection
        .connect("wss://gateway.test:18789", Credentials::token("secret"))
        .await?;
    let peer = gateway.await?;

    let attempts: Vec<String> = connector
        .attempts()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(
        attempts,
        ["wss://gateway.test:18789/", "ws://gateway.test:18789/"]
    );
    assert_eq!(peer.url.scheme(), "ws");
    assert_eq!(session.transport_url.as_str(), "ws://gateway.test:18789/");
    let switch = session.scheme_fallback.as_ref().expect("fallback recorded");
    assert_eq!(switch.from.scheme(), "wss");
    assert_eq!(switch.to.scheme(), "ws");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn fallback_reports_primary_error_when_both_schemes_fail() {
    let (connector, _listener) = MemoryConnector::new();
    connector.refuse("wss://gateway.test:18789/");
    connector.refuse("ws://gateway.test:18789/");
    let connection = connection(&connector, ConnectionConfig::default());

    let error = connection
        .connect("wss://gateway.test:18789", Credentials::token("secret"))
        .await
        .expect_err("both refused");
    let ConnectError::Transport(transport) = error else {
        panic!("expected transport error, got {error:?}");
    };
    assert!(transport.to_string().contains("wss://"));
    assert_eq!(connector.attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn disabled_fallback_tries_one_scheme() {
    let (connector, _listener) = MemoryConnector::new();
    connector.refuse("ws://gateway.test:18789/");
    let config = ConnectionConfig {
        scheme_fallback: SchemeFallback::Disabled,
        ..ConnectionConfig::default()
    };
    let connection = connection(&connector, config);

    assert!(connection
        .connect(GATEWAY, Credentials::token("secret"))
        .await
        .is_err());
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn hanging_transport_hits_connect_timeout() {
    let (connector, _listener) = MemoryConnector::new();
    connector.hang("ws://gateway.test:18789/");
    let config = ConnectionConfig {
        connect_timeout: Duration::from_secs(2),
        scheme_fallback: SchemeFallback::Disabled,
        ..ConnectionConfig::default()
    };
    let connection = connection(&connector, config);

    let error = connection
        .connect(GATEWAY, Credentials::token("secret"))
        .await
        .expect_err("timed out");
    assert!(matches!(
        error,
        ConnectError::Timeout {
            stage: ConnectStage::Transport,
            ..
        }
    ));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn silent_gateway_expires_keepalive() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    let connection = connection(&connector, ConnectionConfig::default());
    let mut lifecycle = connection.lifecycle();
    let _peer = connect_ready(&connection, &mut listener, 1_000).await?;

    let failure = next_lost(&mut lifecycle).await;
    assert_eq!(
        failure,
        ConnectionFailure::KeepaliveExpired {
            silent_for: Duration::from_secs(2)
        }
    );
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn ticks_keep_the_link_alive() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    let connection = connection(&connector, ConnectionConfig::default());
    let peer = connect_ready(&connection, &mut listener, 1_000).await?;

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(900)).await;
        peer.send_event("tick", json!({}));
    }
    assert_eq!(connection.state(), ConnectionState::Ready);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_resolve_to_their_own_responses() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    let connection = connection(&connector, ConnectionConfig::default());
    let mut peer = connect_ready(&connection, &mut listener, 30_000).await?;

    let client = connection.clone();
    let models = tokio::spawn(async move { client.send("models.list", json!({})).await });
    let client = connection.clone();
    let history = tokio::spawn(async move { client.send("chat.history", json!({})).await });

    let first = peer.recv_request().await.expect("first request");
    let second = peer.recv_request().await.expect("second request");
    assert_ne!(first.id, second.id);
    for request in [&second, &first] {
        peer.respond(&request.id, json!({ "method": request.method }));
    }

    assert_eq!(models.await??["method"], "models.list");
    assert_eq!(history.await??["method"], "chat.history");
    assert_eq!(connection.pending_requests(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn gateway_error_fails_only_that_request() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    let connection = connection(&connector, ConnectionConfig::default());
    let mut peer = connect_ready(&connection, &mut listener, 30_000).await?;

    let client = connection.clone();
    let pending = tokio::spawn(async move { client.send("chat.send", json!({})).await });
    let request = peer.recv_request().await.expect("request");
    peer.respond_error(&request.id, "INVALID_REQUEST", "missing sessionKey");

    let Err(RequestError::Gateway(shape)) = pending.await? else {
        panic!("expected gateway error");
    };
    assert_eq!(shape.code, "INVALID_REQUEST");
    assert_eq!(connection.state(), ConnectionState::Ready);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn loss_cancels_pending_requests_and_emits_event() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    let connection = connection(&connector, ConnectionConfig::default());
    let mut peer = connect_ready(&connection, &mut listener, 30_000).await?;
    let mut lost_events = connection.subscribe("connection.lost");

    let client = connection.clone();
    let pending = tokio::spawn(async move { client.send("chat.history", json!({})).await });
    peer.recv_request().await.expect("request");
    peer.close("gateway restarting");

    let Err(RequestError::Cancelled { reason, .. }) = pending.await? else {
        panic!("expected cancellation");
    };
    assert!(matches!(reason, CancelReason::ConnectionLost(_)));
    assert!(matches!(
        lost_events.recv().await,
        Some(GatewayEvent::ConnectionLost { .. })
    ));
    assert_eq!(connection.pending_requests(), 0);
    assert!(matches!(
        connection.send("chat.history", json!({})).await,
        Err(RequestError::NotConnected)
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn request_frame_from_gateway_is_a_protocol_violation() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    let connection = connection(&connector, ConnectionConfig::default());
    let mut lifecycle = connection.lifecycle();
    let peer = connect_ready(&connection, &mut listener, 30_000).await?;

    peer.send_frame(&Frame::Request(RequestFrame::new(
        "srv-1",
        "node.invoke",
        json!({}),
    )));

    let failure = next_lost(&mut lifecycle).await;
    assert_eq!(failure.code(), "protocol_violation");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unknown_frames_are_discarded() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    let connection = connection(&connector, ConnectionConfig::default());
    let peer = connect_ready(&connection, &mut listener, 30_000).await?;
    let mut ticks = connection.subscribe("tick");

    peer.send_text(r#"{"type":"presence","who":"someone"}"#);
    peer.send_event("tick", json!({}));

    assert_eq!(ticks.recv().await, Some(GatewayEvent::Tick));
    assert_eq!(connection.state(), ConnectionState::Ready);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn quiet_stream_synthesizes_timeout() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    let config = ConnectionConfig {
        stream_timeout: Duration::from_secs(3),
        stream_check_interval: Duration::from_secs(1),
        ..ConnectionConfig::default()
    };
    let connection = connection(&connector, config);
    let mut peer = connect_ready(&connection, &mut listener, 60_000).await?;
    let mut timeouts = connection.subscribe("stream.timeout");

    let client = connection.clone();
    let send = tokio::spawn(async move { client.send("chat.send", json!({"message": "hi"})).await });
    let request = peer.recv_request().await.expect("chat.send");
    peer.respond(&request.id, json!({"runId": "run-1", "status": "started"}));
    send.await??;

    let Some(GatewayEvent::StreamTimeout { run_id, idle_ms }) = timeouts.recv().await else {
        panic!("expected stream timeout");
    };
    assert_eq!(run_id, "run-1");
    assert!(idle_ms >= 3_000);
    assert_eq!(connection.state(), ConnectionState::Ready);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn run_finished_right_after_its_response_never_times_out() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    let config = ConnectionConfig {
        stream_timeout: Duration::from_secs(3),
        stream_check_interval: Duration::from_secs(1),
        ..ConnectionConfig::default()
    };
    let connection = connection(&connector, config);
    let mut peer = connect_ready(&connection, &mut listener, 60_000).await?;
    let mut timeouts = connection.subscribe("stream.timeout");
    let mut chats = connection.subscribe("chat");

    let client = connection.clone();
    let send = tokio::spawn(async move { client.send("chat.send", json!({"message": "hi"})).await });
    let request = peer.recv_request().await.expect("chat.send");
    peer.respond(&request.id, json!({"runId": "run-1", "status": "started"}));
    peer.send_event(
        "chat",
        json!({
            "runId": "run-1",
            "sessionKey": "c1",
            "seq": 1,
            "state": "final",
            "message": {"role": "assistant", "content": "done"}
        }),
    );
    send.await??;
    assert!(matches!(chats.recv().await, Some(GatewayEvent::Chat(_))));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(timeouts.try_recv(), None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requests_racing_a_teardown_fail_fast() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    let connection = connection(&connector, ConnectionConfig::default());
    let peer = connect_ready(&connection, &mut listener, 60_000).await?;

    let sends: Vec<_> = (0..64)
        .map(|n| {
            let client = connection.clone();
            tokio::spawn(async move { client.send("chat.send", json!({"message": n})).await })
        })
        .collect();
    peer.close("gateway restarting");

    for send in sends {
        let result = tokio::time::timeout(Duration::from_secs(5), send)
            .await
            .expect("request outlived the connection")?;
        assert!(matches!(
            result,
            Err(RequestError::NotConnected | RequestError::Cancelled { .. })
        ));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn close_is_not_reported_as_loss() -> Result<()> {
    let (connector, mut listener) = MemoryConnector::new();
    let connection = connection(&connector, ConnectionConfig::default());
    let _peer = connect_ready(&connection, &mut listener, 30_000).await?;
    let mut lifecycle = connection.lifecycle();

    connection.close();

    assert!(matches!(
        lifecycle.recv().await?,
        LifecycleSignal::Closed
    ));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    Ok(())
}
