use openagents_gateway_client::RequestError;
use openagents_mirror_store::StoreError;
use thiserror::Error;

/// Local persistence failure seen from async code.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("storage worker failed: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::Worker(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    /// No reconnect is under way, so nothing would drain a queued send.
    NotReconnecting,
    OutboxFull { capacity: usize },
}

impl std::fmt::Display for OfflineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotReconnecting => f.write_str("not connected and not reconnecting"),
            Self::OutboxFull { capacity } => write!(f, "outbox full ({capacity} queued)"),
        }
    }
}

/// Why a message was not accepted. A send is either sent, queued, or
/// rejected with one of these; it is never dropped silently.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("offline: {0}")]
    Offline(OfflineReason),
    #[error("conversation {0} does not exist")]
    UnknownConversation(String),
    #[error("message text is empty")]
    EmptyMessage,
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("failed to persist message: {0}")]
    Persistence(SyncError),
}

impl From<SyncError> for SendError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Store(StoreError::UnknownConversation(id)) => Self::UnknownConversation(id),
            other => Self::Persistence(other),
        }
    }
}
