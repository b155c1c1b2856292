//! Keeps the encrypted local mirror in step with the gateway.
//!
//! [`SyncEngine`] owns the reconnect supervisor for a connection, persists
//! outgoing messages before sending them, holds sends in a bounded outbox
//! while reconnecting, and commits streamed assistant replies when their run
//! ends. Read paths go straight to the store and work offline.

#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

pub mod banner;
pub mod engine;
pub mod error;
pub mod models;
pub mod outbox;
pub mod reply;
pub mod sequencer;

pub use banner::{BannerTone, ConnectionBanner};
pub use engine::{
    Attachment, CHAT_SEND_METHOD, EventOutcome, SendOptions, SendOutcome, SyncConfig, SyncEngine,
    SyncNotice,
};
pub use error::{OfflineReason, SendError, SyncError};
pub use models::{MODELS_LIST_METHOD, ModelInfo};
pub use outbox::{Outbox, OutboxConfig, OutboxFull, QueuedSend, RecentKeys};
pub use reply::StreamingReply;
pub use sequencer::{ApplyDecision, RunSequencer};
