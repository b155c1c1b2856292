#![allow(clippy::expect_used, clippy::panic)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use openagents_gateway_client::proto::{Credentials, GatewayEvent};
use openagents_gateway_client::{
    BackoffLadder, ConnectionConfig, GatewayConnection, MemoryConnector, MemoryListener,
    MemoryPeer, SchemeFallback, SupervisorPhase,
};
use openagents_mirror_store::{EncryptionService, Interruption, MemorySecretStore, MirrorStore, Role};
use openagents_mirror_sync::{
    BannerTone, EventOutcome, OfflineReason, SendError, SendOptions, SendOutcome, SyncConfig,
    SyncEngine, SyncNotice,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

const GATEWAY: &str = "ws://gateway.test:18789/";

struct Harness {
    connector: MemoryConnector,
    listener: MemoryListener,
    engine: SyncEngine,
}

fn harness() -> Result<Harness> {
    let (connector, listener) = MemoryConnector::new();
    let connection = GatewayConnection::new(
        Arc::new(connector.clone()),
        ConnectionConfig {
            scheme_fallback: SchemeFallback::Disabled,
            ..ConnectionConfig::default()
        },
    );
    let crypto = EncryptionService::new(Arc::new(MemorySecretStore::new()), "openagents.sync.test");
    let store = MirrorStore::open_in_memory(Arc::new(crypto))?;
    let engine = SyncEngine::new(
        connection,
        store,
        SyncConfig {
            ladder: BackoffLadder::new([Duration::from_secs(600)]),
            ..SyncConfig::default()
        },
    );
    Ok(Harness {
        connector,
        listener,
        engine,
    })
}

async fn within<F: Future>(future: F) -> Result<F::Output> {
    timeout(Duration::from_secs(5), future)
        .await
        .context("timed out")
}

async fn ready(harness: &mut Harness) -> Result<MemoryPeer> {
    harness.engine.connect(GATEWAY, Credentials::token("secret"));
    let mut peer = within(harness.listener.accept()).await?.context("attempt")?;
    within(peer.accept_handshake(30_000)).await?.context("connect request")?;
    within(
        harness
            .engine
            .connection()
            .watch_state()
            .wait_for(|state| state.is_ready()),
    )
    .await??;
    Ok(peer)
}

async fn next_notice<P>(notices: &mut broadcast::Receiver<SyncNotice>, mut wanted: P) -> Result<SyncNotice>
where
    P: FnMut(&SyncNotice) -> bool,
{
    within(async {
        loop {
            let notice = notices.recv().await?;
            if wanted(&notice) {
                return Ok::<_, anyhow::Error>(notice);
            }
        }
    })
    .await?
}

fn chat(run_id: &str, session: &str, seq: u64, state: &str, text: &str) -> serde_json::Value {
    json!({
        "runId": run_id,
        "sessionKey": session,
        "seq": seq,
        "state": state,
        "message": { "role": "assistant", "content": text },
    })
}

#[tokio::test]
async fn streamed_reply_is_committed_once() -> Result<()> {
    let mut harness = harness()?;
    let mut peer = ready(&mut harness).await?;
    let engine = &harness.engine;
    let conversation = engine.create_conversation("Greetings").await?;
    let mut notices = engine.notices();

    let (outcome, request) = tokio::join!(
        engine.send_chat(&conversation.id, "hello", SendOptions::default()),
        async {
            let request = peer.recv_request().await;
            if let Some(request) = &request {
                peer.respond(&request.id, json!({ "runId": "run-1", "status": "started" }));
            }
            request
        }
    );
    let request = request.context("chat.send")?;
    assert_eq!(request.method, "chat.send");
    assert_eq!(request.params["message"], "hello");
    assert_eq!(request.params["sessionKey"], conversation.id.as_str());
    assert!(request.params.get("thinking").is_none());
    assert!(matches!(outcome?, SendOutcome::Sent { ref run_id, .. } if run_id == "run-1"));

    peer.send_event("chat", chat("run-1", &conversation.id, 1, "delta", "Hel"));
    peer.send_event("chat", chat("run-1", &conversation.id, 2, "delta", "lo"));
    peer.send_event("chat", chat("run-1", &conversation.id, 2, "delta", "lo"));
    let mut done = chat("run-1", &conversation.id, 3, "final", "");
    done["model"] = json!("acme/large");
    done["usage"] = json!({ "input": 5, "output": 2, "totalTokens": 7 });
    peer.send_event("chat", done.clone());

    let committed = next_notice(&mut notices, |notice| {
        matches!(notice, SyncNotice::ReplyCommitted { .. })
    })
    .await?;
    assert!(matches!(
        committed,
        SyncNotice::ReplyCommitted { interrupted: None, .. }
    ));

    // A replayed final after commit must not create a second reply.
    assert_eq!(
        engine.apply_event(GatewayEvent::from_frame(
            openagents_gateway_client::proto::EventFrame::new("chat", done)
        ))
        .await,
        EventOutcome::Duplicate
    );

    let stored = engine.conversation(&conversation.id).await?.context("conversation")?;
    let user: Vec<_> = stored.messages.iter().filter(|m| m.role == Role::User).collect();
    let assistant: Vec<_> = stored
        .messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .collect();
    assert_eq!(user.len(), 1);
    assert_eq!(user[0].content, "hello");
    assert_eq!(assistant.len(), 1);
    assert_eq!(assistant[0].content, "Hello");
    assert_eq!(assistant[0].model_used.as_deref(), Some("acme/large"));
    assert_eq!(assistant[0].usage_tokens, Some(7));
    Ok(())
}

#[tokio::test]
async fn aborted_run_keeps_partial_text() -> Result<()> {
    let harness = harness()?;
    let engine = &harness.engine;
    let conversation = engine.create_conversation("Long answer").await?;

    let delta = |seq, state, text| {
        GatewayEvent::from_frame(openagents_gateway_client::proto::EventFrame::new(
            "chat",
            chat("run-9", &conversation.id, seq, state, text),
        ))
    };
    assert_eq!(
        engine.apply_event(delta(1, "delta", "partial ")).await,
        EventOutcome::Buffered {
            run_id: "run-9".to_string()
        }
    );
    assert_eq!(
        engine
            .streaming_reply("run-9")
            .map(|reply| reply.content),
        Some("partial ".to_string())
    );
    let outcome = engine.apply_event(delta(2, "aborted", "")).await;
    assert!(matches!(outcome, EventOutcome::Committed { .. }));

    let stored = engine.conversation(&conversation.id).await?.context("conversation")?;
    assert_eq!(stored.messages.len(), 1);
    assert_eq!(stored.messages[0].content, "partial ");
    assert_eq!(stored.messages[0].interrupted, Some(Interruption::Aborted));
    Ok(())
}

#[tokio::test]
async fn stream_timeout_and_empty_error_runs() -> Result<()> {
    let harness = harness()?;
    let engine = &harness.engine;
    let conversation = engine.create_conversation("Quiet").await?;
    let event = |run: &str, seq, state, text| {
        GatewayEvent::from_frame(openagents_gateway_client::proto::EventFrame::new(
            "chat",
            chat(run, &conversation.id, seq, state, text),
        ))
    };

    engine.apply_event(event("run-a", 1, "delta", "half")).await;
    let timed_out = engine
        .apply_event(GatewayEvent::StreamTimeout {
            run_id: "run-a".to_string(),
            idle_ms: 60_000,
        })
        .await;
    assert!(matches!(timed_out, EventOutcome::Committed { .. }));

    assert_eq!(
        engine.apply_event(event("run-b", 1, "error", "")).await,
        EventOutcome::Discarded {
            run_id: "run-b".to_string()
        }
    );

    let stored = engine.conversation(&conversation.id).await?.context("conversation")?;
    assert_eq!(stored.messages.len(), 1);
    assert_eq!(stored.messages[0].interrupted, Some(Interruption::TimedOut));
    Ok(())
}

#[tokio::test]
async fn reply_for_unknown_session_creates_the_conversation() -> Result<()> {
    let harness = harness()?;
    let engine = &harness.engine;
    let event = |seq, state, text| {
        GatewayEvent::from_frame(openagents_gateway_client::proto::EventFrame::new(
            "chat",
            chat("run-x", "agent:main", seq, state, text),
        ))
    };
    engine.apply_event(event(1, "delta", "from elsewhere")).await;
    assert!(matches!(
        engine.apply_event(event(2, "final", "")).await,
        EventOutcome::Committed { .. }
    ));
    let stored = engine.conversation("agent:main").await?.context("created")?;
    assert_eq!(stored.messages[0].content, "from elsewhere");
    Ok(())
}

#[tokio::test]
async fn offline_without_reconnect_rejects_and_writes_nothing() -> Result<()> {
    let harness = harness()?;
    let engine = &harness.engine;
    let conversation = engine.create_conversation("Offline").await?;

    let error = engine
        .send_chat(&conversation.id, "anyone there?", SendOptions::default())
        .await
        .expect_err("offline");
    assert!(matches!(
        error,
        SendError::Offline(OfflineReason::NotReconnecting)
    ));
    let stored = engine.conversation(&conversation.id).await?.context("conversation")?;
    assert!(stored.messages.is_empty());

    assert!(matches!(
        engine.send_chat(&conversation.id, "   ", SendOptions::default()).await,
        Err(SendError::EmptyMessage)
    ));
    assert_eq!(engine.banner().tone, BannerTone::Offline);
    Ok(())
}

#[tokio::test]
async fn queued_send_drains_on_reconnect() -> Result<()> {
    let mut harness = harness()?;
    harness.connector.refuse(GATEWAY);
    let engine = &harness.engine;
    let conversation = engine.create_conversation("Later").await?;
    let mut notices = engine.notices();
    let mut status = engine.supervisor().watch();

    engine.connect(GATEWAY, Credentials::token("secret"));
    within(status.wait_for(|status| status.phase == SupervisorPhase::Backoff)).await??;
    assert_eq!(engine.banner().tone, BannerTone::Retrying);

    let outcome = engine
        .send_chat(&conversation.id, "queued hello", SendOptions::default())
        .await?;
    let SendOutcome::Queued {
        message_id,
        position,
    } = outcome
    else {
        panic!("expected a queued outcome");
    };
    assert_eq!(position, 1);
    assert_eq!(engine.outbox_len(), 1);

    harness.connector.allow(GATEWAY);
    engine.supervisor().retry_now();
    let mut peer = within(harness.listener.accept()).await?.context("retry")?;
    within(peer.accept_handshake(30_000)).await?.context("connect request")?;

    let request = within(peer.recv_request()).await?.context("drained send")?;
    assert_eq!(request.method, "chat.send");
    assert_eq!(request.params["message"], "queued hello");
    peer.respond(&request.id, json!({ "runId": "run-q" }));

    let delivered = next_notice(&mut notices, |notice| {
        matches!(notice, SyncNotice::QueuedSendDelivered { .. })
    })
    .await?;
    assert_eq!(
        delivered,
        SyncNotice::QueuedSendDelivered {
            message_id,
            run_id: "run-q".to_string()
        }
    );
    assert_eq!(engine.outbox_len(), 0);
    Ok(())
}

#[tokio::test]
async fn sends_made_during_a_drain_go_out_after_the_queue() -> Result<()> {
    let mut harness = harness()?;
    harness.connector.refuse(GATEWAY);
    let engine = &harness.engine;
    let conversation = engine.create_conversation("Ordered").await?;
    let mut status = engine.supervisor().watch();

    engine.connect(GATEWAY, Credentials::token("secret"));
    within(status.wait_for(|status| status.phase == SupervisorPhase::Backoff)).await??;
    for text in ["first", "second"] {
        let outcome = engine
            .send_chat(&conversation.id, text, SendOptions::default())
            .await?;
        assert!(matches!(outcome, SendOutcome::Queued { .. }));
    }

    harness.connector.allow(GATEWAY);
    engine.supervisor().retry_now();
    let mut peer = within(harness.listener.accept()).await?.context("retry")?;
    within(peer.accept_handshake(30_000)).await?.context("connect request")?;

    let first = within(peer.recv_request()).await?.context("first drained send")?;
    assert_eq!(first.params["message"], "first");
    assert!(engine.connection().state().is_ready());

    // Ready, but older sends are still going out.
    let outcome = engine
        .send_chat(&conversation.id, "third", SendOptions::default())
        .await?;
    assert!(matches!(outcome, SendOutcome::Queued { .. }));

    peer.respond(&first.id, json!({ "runId": "run-1" }));
    let mut order = vec![first.params["message"].clone()];
    for run in ["run-2", "run-3"] {
        let request = within(peer.recv_request()).await?.context("next send")?;
        assert_eq!(request.method, "chat.send");
        order.push(request.params["message"].clone());
        peer.respond(&request.id, json!({ "runId": run }));
    }
    assert_eq!(order, [json!("first"), json!("second"), json!("third")]);
    Ok(())
}

#[tokio::test]
async fn lost_connection_flushes_partial_replies() -> Result<()> {
    let mut harness = harness()?;
    let peer = ready(&mut harness).await?;
    let engine = &harness.engine;
    let conversation = engine.create_conversation("Flaky").await?;
    let mut notices = engine.notices();

    peer.send_event("chat", chat("run-l", &conversation.id, 1, "delta", "cut off"));
    next_notice(&mut notices, |notice| matches!(notice, SyncNotice::ReplyDelta { .. })).await?;
    peer.close("network gone");

    let committed = next_notice(&mut notices, |notice| {
        matches!(notice, SyncNotice::ReplyCommitted { .. })
    })
    .await?;
    assert!(matches!(
        committed,
        SyncNotice::ReplyCommitted {
            interrupted: Some(Interruption::Failed),
            ..
        }
    ));
    let stored = engine.conversation(&conversation.id).await?.context("conversation")?;
    assert_eq!(stored.messages[0].content, "cut off");
    Ok(())
}

#[tokio::test]
async fn model_list_comes_from_the_gateway() -> Result<()> {
    let mut harness = harness()?;
    let mut peer = ready(&mut harness).await?;
    let engine = &harness.engine;

    let (models, _) = tokio::join!(engine.list_models(), async {
        if let Some(request) = peer.recv_request().await {
            assert_eq!(request.method, "models.list");
            peer.respond(
                &request.id,
                json!({ "models": [{ "id": "acme/large", "name": "Large", "provider": "acme", "contextWindow": 128000 }] }),
            );
        }
    });
    let models = models?;
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].context_window, Some(128_000));
    Ok(())
}

#[tokio::test]
async fn reads_work_offline() -> Result<()> {
    let harness = harness()?;
    let engine = &harness.engine;
    let conversation = engine.create_conversation("Searchable notes").await?;
    let hits = engine.search("search", None).await?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].conversation_id(), conversation.id);
    assert_eq!(engine.conversations().await?.conversations.len(), 1);
    assert!(engine.delete_conversation(&conversation.id).await?);
    Ok(())
}
