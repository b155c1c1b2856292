//! Glue between the gateway connection and the local mirror.
//!
//! One pump task consumes every dispatched event and every lifecycle signal.
//! Chat events fold into in-memory [`StreamingReply`] buffers and are
//! committed to the store when their run ends. Sends made while the
//! supervisor is reconnecting wait in the [`Outbox`] and drain on `Ready`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use openagents_gateway_client::{
    ALL_EVENTS, BackoffLadder, GatewayConnection, LifecycleSignal, ReconnectSupervisor,
    RequestError, Subscription, SupervisorPhase,
};
use openagents_gateway_proto::{ChatEvent, ChatState, Credentials, GatewayEvent};
use openagents_mirror_store::{
    Conversation, ConversationWithMessages, Interruption, LoadReport, Message, MirrorStore, Role,
    SearchHit, StoreError,
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::banner::ConnectionBanner;
use crate::error::{OfflineReason, SendError, SyncError};
use crate::models::{MODELS_LIST_METHOD, ModelInfo, ModelList};
use crate::outbox::{DEFAULT_RECENT_KEYS, Outbox, OutboxConfig, QueuedSend, RecentKeys};
use crate::reply::StreamingReply;
use crate::sequencer::{ApplyDecision, RunSequencer};

pub const CHAT_SEND_METHOD: &str = "chat.send";
const NOTICE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub outbox: OutboxConfig,
    pub ladder: BackoffLadder,
    /// How many delivered idempotency keys and finished run ids to remember.
    pub recent_keys: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            outbox: OutboxConfig::default(),
            ladder: BackoffLadder::default(),
            recent_keys: DEFAULT_RECENT_KEYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Base64 payload.
    pub content: String,
}

impl Attachment {
    fn kind(&self) -> &'static str {
        if self.mime_type.starts_with("image/") {
            "image"
        } else if self.mime_type.starts_with("text/") {
            "text"
        } else {
            "file"
        }
    }

    fn to_wire(&self) -> Value {
        json!({
            "type": self.kind(),
            "mimeType": self.mime_type,
            "fileName": self.file_name,
            "content": self.content,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Reasoning level forwarded as `thinking`; omitted when `None`.
    pub thinking: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { message_id: String, run_id: String },
    /// Held in the outbox; `position` is 1-based.
    Queued { message_id: String, position: usize },
}

/// What applying one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Ignored,
    Duplicate,
    Buffered { run_id: String },
    Committed { message_id: String },
    /// Kept in memory after the store refused it.
    Unsaved { message_id: String },
    /// The run ended with nothing worth keeping.
    Discarded { run_id: String },
    /// Every in-flight reply was closed out after a connection loss.
    Flushed { committed: usize, unsaved: usize },
}

/// Progress the UI may want to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    ReplyDelta {
        conversation_id: String,
        run_id: String,
        text: String,
    },
    ReplyCommitted {
        conversation_id: String,
        message_id: String,
        interrupted: Option<Interruption>,
    },
    ReplyUnsaved {
        conversation_id: String,
        message_id: String,
        error: String,
    },
    ReplyFailed {
        conversation_id: String,
        run_id: String,
        error: Option<String>,
    },
    QueuedSendDelivered {
        message_id: String,
        run_id: String,
    },
    QueuedSendDropped {
        message_id: String,
        reason: String,
    },
}

struct EngineState {
    outbox: Outbox,
    delivered: RecentKeys,
    finished_runs: RecentKeys,
    sequencer: RunSequencer,
    replies: HashMap<String, StreamingReply>,
    run_conversations: HashMap<String, String>,
    unsaved: HashMap<String, Message>,
    /// Set while the pump delivers queued sends; new sends queue behind them.
    draining: bool,
}

struct Shared {
    connection: GatewayConnection,
    store: MirrorStore,
    state: Mutex<EngineState>,
    notices: broadcast::Sender<SyncNotice>,
    drain_wake: Notify,
}

enum Route {
    Live,
    Queue,
}

pub struct SyncEngine {
    shared: Arc<Shared>,
    supervisor: ReconnectSupervisor,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("connection", &self.shared.connection)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl SyncEngine {
    /// Must be called inside a Tokio runtime.
    pub fn new(connection: GatewayConnection, store: MirrorStore, config: SyncConfig) -> Self {
        let supervisor = ReconnectSupervisor::spawn(connection.clone(), config.ladder.clone());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let events = connection.subscribe(ALL_EVENTS);
        let lifecycle = connection.lifecycle();
        let shared = Arc::new(Shared {
            connection,
            store,
            state: Mutex::new(EngineState {
                outbox: Outbox::new(config.outbox),
                delivered: RecentKeys::new(config.recent_keys),
                finished_runs: RecentKeys::new(config.recent_keys),
                sequencer: RunSequencer::default(),
                replies: HashMap::new(),
                run_conversations: HashMap::new(),
                unsaved: HashMap::new(),
                draining: false,
            }),
            notices,
            drain_wake: Notify::new(),
        });
        let pump = tokio::spawn(pump(Arc::clone(&shared), events, lifecycle));
        Self {
            shared,
            supervisor,
            pump,
        }
    }

    #[must_use]
    pub fn connection(&self) -> &GatewayConnection {
        &self.shared.connection
    }

    #[must_use]
    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    #[must_use]
    pub fn store(&self) -> &MirrorStore {
        &self.shared.store
    }

    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.shared.notices.subscribe()
    }

    pub fn connect(&self, url: impl Into<String>, credentials: Credentials) {
        self.supervisor.start(url, credentials);
    }

    /// Manual disconnect. Queued sends stay queued.
    pub fn disconnect(&self) {
        self.supervisor.close();
    }

    #[must_use]
    pub fn banner(&self) -> ConnectionBanner {
        ConnectionBanner::from_status(
            &self.supervisor.status(),
            self.shared.connection.quality(),
            Instant::now(),
        )
    }

    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.shared.state().outbox.len()
    }

    #[must_use]
    pub fn streaming_reply(&self, run_id: &str) -> Option<StreamingReply> {
        self.shared.state().replies.get(run_id).cloned()
    }

    /// Replies the store refused, oldest first.
    #[must_use]
    pub fn unsaved_replies(&self) -> Vec<Message> {
        let mut unsaved: Vec<Message> = self.shared.state().unsaved.values().cloned().collect();
        unsaved.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        unsaved
    }

    /// Try to persist unsaved replies again. Returns how many were saved.
    pub async fn retry_unsaved(&self) -> Result<usize, SyncError> {
        let mut saved = 0;
        for message in self.unsaved_replies() {
            self.shared.persist_reply(message.clone()).await?;
            self.shared.state().unsaved.remove(&message.id);
            saved += 1;
        }
        Ok(saved)
    }

    pub async fn create_conversation(&self, title: &str) -> Result<Conversation, SyncError> {
        let conversation = Conversation::new(Uuid::new_v4().to_string(), title, Utc::now());
        let record = conversation.clone();
        self.shared
            .blocking(move |store| store.upsert_conversation(&record))
            .await?;
        Ok(conversation)
    }

    pub async fn conversations(&self) -> Result<LoadReport, SyncError> {
        self.shared.blocking(MirrorStore::load_all).await
    }

    pub async fn conversation(&self, id: &str) -> Result<Option<ConversationWithMessages>, SyncError> {
        let id = id.to_string();
        self.shared
            .blocking(move |store| store.load_conversation(&id))
            .await
    }

    pub async fn search(&self, query: &str, scope: Option<&str>) -> Result<Vec<SearchHit>, SyncError> {
        let query = query.to_string();
        let scope = scope.map(ToString::to_string);
        self.shared
            .blocking(move |store| store.search(&query, scope.as_deref()))
            .await
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<bool, SyncError> {
        let id = id.to_string();
        self.shared
            .blocking(move |store| store.delete_conversation(&id))
            .await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, RequestError> {
        let list: ModelList = self
            .shared
            .connection
            .request(MODELS_LIST_METHOD, &json!({}))
            .await?;
        Ok(list.models)
    }

    /// Persist the user's message, then send it or queue it.
    ///
    /// When the gateway is unreachable and no reconnect is under way, or the
    /// outbox is full, the send is rejected before anything is written.
    pub async fn send_chat(
        &self,
        conversation_id: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<SendOutcome, SendError> {
        if text.trim().is_empty() && options.attachments.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        let route = self.route()?;

        let message = Message::new(
            Uuid::new_v4().to_string(),
            conversation_id,
            Role::User,
            text,
            Utc::now(),
        );
        let message_id = message.id.clone();
        self.shared
            .blocking(move |store| store.upsert_message(&message))
            .await?;

        let idempotency_key = Uuid::new_v4().to_string();
        let params = chat_send_params(conversation_id, text, &idempotency_key, &options);

        if matches!(route, Route::Live) {
            match self.shared.deliver(conversation_id, &idempotency_key, params.clone()).await {
                Ok(run_id) => return Ok(SendOutcome::Sent { message_id, run_id }),
                Err(RequestError::NotConnected) => {
                    debug!(%message_id, "connection dropped before send; queueing");
                }
                Err(error) => return Err(error.into()),
            }
        }

        let entry = QueuedSend {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.clone(),
            idempotency_key,
            params,
            enqueued_at: Instant::now(),
            attempts: 0,
        };
        let position = self.shared.enqueue(entry)?;
        // A drain that finished after `route` picked the queue must still
        // pick this entry up.
        self.shared.drain_wake.notify_one();
        info!(%message_id, position, "queued chat send until the gateway reconnects");
        Ok(SendOutcome::Queued {
            message_id,
            position,
        })
    }

    /// Apply one event directly. The pump does this for dispatched events.
    pub async fn apply_event(&self, event: GatewayEvent) -> EventOutcome {
        self.shared.apply_event(event).await
    }

    /// Live only when nothing queued is still waiting to go out, so sends
    /// reach the gateway in the order they were made.
    fn route(&self) -> Result<Route, SendError> {
        if self.shared.connection.state().is_ready() {
            let state = self.shared.state();
            if !state.draining && state.outbox.is_empty() {
                return Ok(Route::Live);
            }
        } else if matches!(
            self.supervisor.status().phase,
            SupervisorPhase::Idle | SupervisorPhase::Halted
        ) {
            return Err(SendError::Offline(OfflineReason::NotReconnecting));
        }
        let state = self.shared.state();
        if state.outbox.len() >= state.outbox.config().capacity {
            return Err(SendError::Offline(OfflineReason::OutboxFull {
                capacity: state.outbox.config().capacity,
            }));
        }
        Ok(Route::Queue)
    }
}

fn chat_send_params(
    conversation_id: &str,
    text: &str,
    idempotency_key: &str,
    options: &SendOptions,
) -> Value {
    let mut params = json!({
        "message": text,
        "sessionKey": conversation_id,
        "idempotencyKey": idempotency_key,
    });
    // The gateway rejects an explicit null here.
    if let Some(thinking) = &options.thinking {
        params["thinking"] = json!(thinking);
    }
    if !options.attachments.is_empty() {
        params["attachments"] = options
            .attachments
            .iter()
            .map(Attachment::to_wire)
            .collect::<Vec<_>>()
            .into();
    }
    params
}

async fn pump(
    shared: Arc<Shared>,
    mut events: Subscription,
    mut lifecycle: broadcast::Receiver<LifecycleSignal>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("event dispatcher closed; sync pump stopping");
                    break;
                };
                shared.apply_event(event).await;
            }
            signal = lifecycle.recv() => match signal {
                Ok(LifecycleSignal::Ready(_)) => shared.drain_outbox().await,
                Ok(LifecycleSignal::Lost { .. } | LifecycleSignal::Closed) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "openagents.mirror", skipped, "sync pump lagged behind lifecycle signals");
                    if shared.connection.state().is_ready() {
                        shared.drain_outbox().await;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            () = shared.drain_wake.notified() => {
                if shared.connection.state().is_ready() {
                    shared.drain_outbox().await;
                }
            }
        }
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notice: SyncNotice) {
        let _ = self.notices.send(notice);
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, SyncError>
    where
        F: FnOnce(&MirrorStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || work(&store)).await??)
    }

    fn enqueue(&self, entry: QueuedSend) -> Result<usize, SendError> {
        let (expired, pushed) = {
            let mut state = self.state();
            let expired = state.outbox.take_expired(Instant::now());
            (expired, state.outbox.push(entry))
        };
        for stale in &expired {
            self.drop_queued(stale, "expired before the gateway reconnected");
        }
        pushed.map_err(|full| {
            SendError::Offline(OfflineReason::OutboxFull {
                capacity: full.capacity,
            })
        })
    }

    fn drop_queued(&self, entry: &QueuedSend, reason: &str) {
        warn!(
            target: "openagents.mirror",
            message_id = %entry.message_id,
            attempts = entry.attempts,
            %reason,
            "dropping queued chat send"
        );
        self.notify(SyncNotice::QueuedSendDropped {
            message_id: entry.message_id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Send one `chat.send` and remember its run. Returns the run id.
    async fn deliver(
        &self,
        conversation_id: &str,
        idempotency_key: &str,
        params: Value,
    ) -> Result<String, RequestError> {
        let payload = self.connection.send(CHAT_SEND_METHOD, params).await?;
        let run_id = payload
            .get("runId")
            .and_then(Value::as_str)
            .unwrap_or(idempotency_key)
            .to_string();
        let mut state = self.state();
        state.delivered.insert(idempotency_key);
        state
            .run_conversations
            .insert(run_id.clone(), conversation_id.to_string());
        Ok(run_id)
    }

    /// Deliver queued sends oldest first, including any queued while this
    /// runs, until the outbox is empty or the link goes away.
    async fn drain_outbox(&self) {
        loop {
            // Taken under one lock so a sender sees either the entries or
            // the flag.
            let batch = {
                let mut state = self.state();
                let batch = state.outbox.drain(Instant::now());
                state.draining = !batch.ready.is_empty();
                batch
            };
            for stale in &batch.expired {
                self.drop_queued(stale, "expired before the gateway reconnected");
            }
            if batch.ready.is_empty() {
                break;
            }
            info!(queued = batch.ready.len(), "draining outbox");
            let link_lost = self.deliver_batch(batch.ready).await;
            if link_lost {
                break;
            }
        }
        self.state().draining = false;
    }

    /// Returns `true` when the connection dropped partway. Undelivered
    /// entries go back to the front of the outbox either way.
    async fn deliver_batch(&self, ready: Vec<QueuedSend>) -> bool {
        let mut retained = Vec::new();
        let mut link_lost = false;
        let mut pending = ready.into_iter();
        while let Some(entry) = pending.next() {
            if self.state().delivered.contains(&entry.idempotency_key) {
                debug!(message_id = %entry.message_id, "queued send already delivered");
                continue;
            }
            match self
                .deliver(&entry.conversation_id, &entry.idempotency_key, entry.params.clone())
                .await
            {
                Ok(run_id) => self.notify(SyncNotice::QueuedSendDelivered {
                    message_id: entry.message_id,
                    run_id,
                }),
                Err(RequestError::NotConnected | RequestError::Cancelled { .. }) => {
                    // Wait for the next Ready.
                    retained.push(entry);
                    retained.extend(pending);
                    link_lost = true;
                    break;
                }
                Err(RequestError::Gateway(shape)) if !shape.is_retryable() => {
                    self.drop_queued(&entry, &format!("gateway refused it: {shape}"));
                }
                Err(error) => match self.state().outbox.charge_attempt(entry) {
                    Ok(entry) => {
                        debug!(message_id = %entry.message_id, %error, "queued send failed; keeping it");
                        retained.push(entry);
                    }
                    Err(exhausted) => self.drop_queued(&exhausted, &error.to_string()),
                },
            }
        }
        self.state().outbox.restore_front(retained.into_iter());
        link_lost
    }

    async fn apply_event(&self, event: GatewayEvent) -> EventOutcome {
        match event {
            GatewayEvent::Chat(chat) => self.apply_chat(chat).await,
            GatewayEvent::StreamTimeout { run_id, idle_ms } => {
                let reply = self.take_reply(&run_id);
                match reply {
                    Some(reply) if !reply.content.is_empty() => {
                        warn!(target: "openagents.mirror", %run_id, idle_ms, "stream went quiet; keeping partial reply");
                        self.commit_reply(reply, Some(Interruption::TimedOut)).await
                    }
                    Some(reply) => {
                        self.notify(SyncNotice::ReplyFailed {
                            conversation_id: reply.conversation_id,
                            run_id: run_id.clone(),
                            error: Some(format!("no output for {idle_ms} ms")),
                        });
                        EventOutcome::Discarded { run_id }
                    }
                    None => EventOutcome::Ignored,
                }
            }
            GatewayEvent::ConnectionLost { reason } => {
                let replies: Vec<StreamingReply> = {
                    let mut state = self.state();
                    state.sequencer.clear();
                    let replies: Vec<StreamingReply> =
                        state.replies.drain().map(|(_, reply)| reply).collect();
                    for reply in &replies {
                        state.finished_runs.insert(&reply.run_id);
                        state.run_conversations.remove(&reply.run_id);
                    }
                    replies
                };
                if !replies.is_empty() {
                    warn!(target: "openagents.mirror", %reason, runs = replies.len(), "connection lost mid-reply");
                }
                let mut committed = 0;
                let mut unsaved = 0;
                for reply in replies.into_iter().filter(|reply| !reply.content.is_empty()) {
                    match self.commit_reply(reply, Some(Interruption::Failed)).await {
                        EventOutcome::Committed { .. } => committed += 1,
                        _ => unsaved += 1,
                    }
                }
                EventOutcome::Flushed { committed, unsaved }
            }
            GatewayEvent::Tick | GatewayEvent::Shutdown { .. } | GatewayEvent::Other { .. } => {
                EventOutcome::Ignored
            }
        }
    }

    async fn apply_chat(&self, chat: ChatEvent) -> EventOutcome {
        let Some(run_id) = chat.run_id.clone() else {
            debug!("chat event without runId ignored");
            return EventOutcome::Ignored;
        };

        let finished = {
            let mut state = self.state();
            if state.finished_runs.contains(&run_id) {
                return EventOutcome::Duplicate;
            }
            let Some(conversation_id) = state
                .run_conversations
                .get(&run_id)
                .cloned()
                .or_else(|| chat.session_key.clone())
            else {
                warn!(target: "openagents.mirror", %run_id, "chat event for an unknown session ignored");
                return EventOutcome::Ignored;
            };

            if let Some(seq) = chat.seq {
                match state.sequencer.apply(&run_id, seq) {
                    ApplyDecision::Duplicate { watermark } => {
                        debug!(%run_id, seq, watermark, "dropping duplicate chat event");
                        return EventOutcome::Duplicate;
                    }
                    ApplyDecision::Gap { watermark, incoming } => {
                        warn!(target: "openagents.mirror", %run_id, watermark, incoming, "chat events missing");
                    }
                    ApplyDecision::Applied { .. } => {}
                }
            }

            let reply = state.replies.entry(run_id.clone()).or_insert_with(|| {
                StreamingReply::new(
                    run_id.clone(),
                    conversation_id.clone(),
                    Uuid::new_v4().to_string(),
                    Utc::now(),
                )
            });
            match chat.state {
                ChatState::Delta => {
                    reply.absorb_delta(&chat);
                    let text = chat.text();
                    drop(state);
                    self.notify(SyncNotice::ReplyDelta {
                        conversation_id,
                        run_id: run_id.clone(),
                        text,
                    });
                    return EventOutcome::Buffered { run_id };
                }
                ChatState::Final | ChatState::Aborted => reply.absorb_final(&chat),
                ChatState::Error => {}
            }
            let reply = state.replies.remove(&run_id);
            state.sequencer.forget(&run_id);
            state.run_conversations.remove(&run_id);
            state.finished_runs.insert(&run_id);
            reply
        };
        let Some(reply) = finished else {
            return EventOutcome::Ignored;
        };

        match chat.state {
            ChatState::Final => self.commit_reply(reply, None).await,
            ChatState::Aborted | ChatState::Error => {
                let interruption = if chat.state == ChatState::Aborted {
                    Interruption::Aborted
                } else {
                    Interruption::Failed
                };
                if chat.state == ChatState::Error {
                    warn!(
                        target: "openagents.mirror",
                        %run_id,
                        error = chat.error_message.as_deref().unwrap_or("unknown error"),
                        "run failed"
                    );
                    self.notify(SyncNotice::ReplyFailed {
                        conversation_id: reply.conversation_id.clone(),
                        run_id: run_id.clone(),
                        error: chat.error_message.clone(),
                    });
                }
                if reply.content.is_empty() {
                    EventOutcome::Discarded { run_id }
                } else {
                    self.commit_reply(reply, Some(interruption)).await
                }
            }
            ChatState::Delta => EventOutcome::Ignored,
        }
    }

    fn take_reply(&self, run_id: &str) -> Option<StreamingReply> {
        let mut state = self.state();
        let reply = state.replies.remove(run_id)?;
        state.sequencer.forget(run_id);
        state.run_conversations.remove(run_id);
        state.finished_runs.insert(run_id);
        Some(reply)
    }

    async fn commit_reply(
        &self,
        reply: StreamingReply,
        interrupted: Option<Interruption>,
    ) -> EventOutcome {
        let message = reply.into_message(interrupted);
        let message_id = message.id.clone();
        let conversation_id = message.conversation_id.clone();
        match self.persist_reply(message.clone()).await {
            Ok(()) => {
                debug!(%conversation_id, %message_id, "committed assistant reply");
                self.notify(SyncNotice::ReplyCommitted {
                    conversation_id,
                    message_id: message_id.clone(),
                    interrupted,
                });
                EventOutcome::Committed { message_id }
            }
            Err(error) => {
                warn!(
                    target: "openagents.mirror",
                    %conversation_id,
                    %message_id,
                    %error,
                    "could not persist reply; keeping it in memory"
                );
                self.state().unsaved.insert(message_id.clone(), message);
                self.notify(SyncNotice::ReplyUnsaved {
                    conversation_id,
                    message_id: message_id.clone(),
                    error: error.to_string(),
                });
                EventOutcome::Unsaved { message_id }
            }
        }
    }

    /// Runs started elsewhere may name a conversation this mirror has never
    /// seen; it is created under the session key.
    async fn persist_reply(&self, message: Message) -> Result<(), SyncError> {
        self.blocking(move |store| match store.upsert_message(&message) {
            Err(StoreError::UnknownConversation(id)) => {
                let conversation = Conversation::new(id.clone(), id, message.timestamp);
                store.upsert_conversation_with_messages(&conversation, std::slice::from_ref(&message))
            }
            other => other,
        })
        .await
    }
}
