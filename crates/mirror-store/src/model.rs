use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Why an assistant reply ended before its final event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interruption {
    Aborted,
    Failed,
    TimedOut,
}

impl Interruption {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "aborted" => Some(Self::Aborted),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Encrypted at rest.
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub model: Option<String>,
    pub pinned: bool,
    pub thinking_enabled: bool,
    /// Encrypted at rest.
    pub system_prompt: Option<String>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            model: None,
            pinned: false,
            thinking_enabled: false,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    /// Encrypted at rest.
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub model_used: Option<String>,
    /// Encrypted at rest.
    pub thinking_content: Option<String>,
    pub usage_tokens: Option<u64>,
    pub interrupted: Option<Interruption>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            timestamp,
            model_used: None,
            thinking_content: None,
            usage_tokens: None,
            interrupted: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationWithMessages {
    pub conversation: Conversation,
    /// Oldest first.
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Conversation,
    Message,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Message => "message",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "conversation" => Some(Self::Conversation),
            "message" => Some(Self::Message),
            _ => None,
        }
    }
}

/// A record left out of a load because it could not be read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub kind: RecordKind,
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub conversations: Vec<ConversationWithMessages>,
    pub skipped: Vec<SkippedRecord>,
    /// Fields still stored as pre-encryption plaintext.
    pub legacy_fields: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchHit {
    Conversation {
        conversation_id: String,
        title: String,
        updated_at: DateTime<Utc>,
    },
    Message {
        message_id: String,
        conversation_id: String,
        role: Role,
        content: String,
        timestamp: DateTime<Utc>,
    },
}

impl SearchHit {
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Conversation {
                conversation_id, ..
            }
            | Self::Message {
                conversation_id, ..
            } => conversation_id,
        }
    }
}
