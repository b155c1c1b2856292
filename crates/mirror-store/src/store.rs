//! SQLite-backed encrypted mirror.
//!
//! Sensitive fields are sealed before the write lock is taken; each logical
//! unit (a conversation and/or its messages) is written in one transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{CryptoError, EncryptionService};
use crate::model::{
    Conversation, ConversationWithMessages, Interruption, LoadReport, Message, RecordKind, Role,
    SearchHit, SkippedRecord,
};
use crate::search::{matches_all, tokenize};

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    system_prompt TEXT,
    model TEXT,
    pinned INTEGER NOT NULL DEFAULT 0,
    thinking_enabled INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK(role IN ('user', 'assistant', 'system')),
    content TEXT NOT NULL,
    thinking_content TEXT,
    model_used TEXT,
    usage_tokens INTEGER,
    interrupted TEXT,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, timestamp);

CREATE TABLE IF NOT EXISTS search_tokens (
    record_kind TEXT NOT NULL CHECK(record_kind IN ('conversation', 'message')),
    record_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    token TEXT NOT NULL,
    PRIMARY KEY (record_kind, record_id, token)
);

CREATE INDEX IF NOT EXISTS idx_search_tokens_conversation
    ON search_tokens(conversation_id);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("conversation {0} does not exist")]
    UnknownConversation(String),
    #[error("message {message_id} belongs to {found}, not {expected}")]
    MismatchedConversation {
        message_id: String,
        expected: String,
        found: String,
    },
    #[error("{kind} {id} has an invalid {field}")]
    Corrupt {
        kind: &'static str,
        id: String,
        field: &'static str,
    },
    #[error("database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Points inside a unit write where a test can simulate a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStep {
    Conversation,
    Message(usize),
    Commit,
}

struct SealedConversation {
    id: String,
    title: String,
    system_prompt: Option<String>,
    model: Option<String>,
    pinned: bool,
    thinking_enabled: bool,
    created_at: i64,
    updated_at: i64,
    tokens: Vec<String>,
}

struct SealedMessage {
    id: String,
    conversation_id: String,
    role: Role,
    content: String,
    thinking_content: Option<String>,
    model_used: Option<String>,
    usage_tokens: Option<i64>,
    interrupted: Option<Interruption>,
    timestamp: i64,
    tokens: Vec<String>,
}

struct ConversationRow {
    id: String,
    title: String,
    system_prompt: Option<String>,
    model: Option<String>,
    pinned: bool,
    thinking_enabled: bool,
    created_at: i64,
    updated_at: i64,
}

struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    thinking_content: Option<String>,
    model_used: Option<String>,
    usage_tokens: Option<i64>,
    interrupted: Option<String>,
    timestamp: i64,
}

const CONVERSATION_COLUMNS: &str =
    "id, title, system_prompt, model, pinned, thinking_enabled, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, thinking_content, model_used, usage_tokens, interrupted, timestamp";

fn conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        title: row.get(1)?,
        system_prompt: row.get(2)?,
        model: row.get(3)?,
        pinned: row.get(4)?,
        thinking_enabled: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        thinking_content: row.get(4)?,
        model_used: row.get(5)?,
        usage_tokens: row.get(6)?,
        interrupted: row.get(7)?,
        timestamp: row.get(8)?,
    })
}

/// Legacy-plaintext counter shared by one read pass.
#[derive(Default)]
struct OpenStats {
    legacy_fields: usize,
}

#[derive(Clone)]
pub struct MirrorStore {
    conn: Arc<Mutex<Connection>>,
    crypto: Arc<EncryptionService>,
}

impl std::fmt::Debug for MirrorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorStore").finish_non_exhaustive()
    }
}

impl MirrorStore {
    pub fn open(path: impl AsRef<Path>, crypto: Arc<EncryptionService>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self::with_connection(conn, crypto)?;
        info!(target: "openagents.mirror", path = %path.as_ref().display(), "opened local mirror");
        Ok(store)
    }

    pub fn open_in_memory(crypto: Arc<EncryptionService>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn, crypto)
    }

    fn with_connection(conn: Connection, crypto: Arc<EncryptionService>) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            crypto,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn crypto(&self) -> &Arc<EncryptionService> {
        &self.crypto
    }

    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let sealed = self.seal_conversation(conversation)?;
        self.commit_unit(Some(&sealed), &[], &mut |_| Ok(()))
    }

    /// Fails with [`StoreError::UnknownConversation`] if the parent is missing.
    pub fn upsert_message(&self, message: &Message) -> Result<()> {
        let sealed = self.seal_message(message)?;
        self.commit_unit(None, std::slice::from_ref(&sealed), &mut |_| Ok(()))
    }

    /// Write a conversation and its messages as one unit.
    pub fn upsert_conversation_with_messages(
        &self,
        conversation: &Conversation,
        messages: &[Message],
    ) -> Result<()> {
        let (sealed, sealed_messages) = self.seal_unit(conversation, messages)?;
        self.commit_unit(Some(&sealed), &sealed_messages, &mut |_| Ok(()))
    }

    /// Remove a conversation with its messages and search tokens.
    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        debug!(target: "openagents.mirror", conversation = %id, removed, "deleted conversation");
        Ok(removed > 0)
    }

    pub fn delete_message(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM search_tokens WHERE record_kind = 'message' AND record_id = ?1",
            params![id],
        )?;
        let removed = tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Every readable conversation, newest first, messages oldest first.
    ///
    /// Records that fail to decrypt are skipped and listed in the report.
    pub fn load_all(&self) -> Result<LoadReport> {
        let (conversation_rows, message_rows) = {
            let conn = self.conn();
            let mut statement = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations ORDER BY updated_at DESC, id"
            ))?;
            let conversations = statement
                .query_map([], conversation_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut statement = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY timestamp, id"
            ))?;
            let messages = statement
                .query_map([], message_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            (conversations, messages)
        };

        let mut report = LoadReport::default();
        let mut stats = OpenStats::default();
        let mut grouped: HashMap<String, Vec<Message>> = HashMap::new();
        for row in message_rows {
            let id = row.id.clone();
            match self.open_message(row, &mut stats) {
                Ok(message) => grouped
                    .entry(message.conversation_id.clone())
                    .or_default()
                    .push(message),
                Err(error) => report.skipped.push(skip(RecordKind::Message, id, &error)),
            }
        }
        for row in conversation_rows {
            let id = row.id.clone();
            match self.open_conversation(row, &mut stats) {
                Ok(conversation) => {
                    let messages = grouped.remove(&conversation.id).unwrap_or_default();
                    report.conversations.push(ConversationWithMessages {
                        conversation,
                        messages,
                    });
                }
                Err(error) => {
                    if let Some(orphans) = grouped.remove(&id) {
                        debug!(target: "openagents.mirror", conversation = %id, messages = orphans.len(), "dropping messages of unreadable conversation");
                    }
                    report.skipped.push(skip(RecordKind::Conversation, id, &error));
                }
            }
        }
        report.legacy_fields = stats.legacy_fields;
        Ok(report)
    }

    /// One conversation with its messages. Unreadable messages are skipped.
    pub fn load_conversation(&self, id: &str) -> Result<Option<ConversationWithMessages>> {
        let (conversation_row, message_rows) = {
            let conn = self.conn();
            let conversation = conn
                .query_row(
                    &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                    params![id],
                    conversation_row,
                )
                .optional()?;
            let Some(conversation) = conversation else {
                return Ok(None);
            };
            let mut statement = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY timestamp, id"
            ))?;
            let messages = statement
                .query_map(params![id], message_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            (conversation, messages)
        };

        let mut stats = OpenStats::default();
        let conversation = self.open_conversation(conversation_row, &mut stats)?;
        let mut messages = Vec::with_capacity(message_rows.len());
        for row in message_rows {
            let message_id = row.id.clone();
            match self.open_message(row, &mut stats) {
                Ok(message) => messages.push(message),
                Err(error) => warn!(
                    target: "openagents.mirror",
                    message = %message_id,
                    %error,
                    "skipping unreadable message"
                ),
            }
        }
        Ok(Some(ConversationWithMessages {
            conversation,
            messages,
        }))
    }

    /// Conversations whose title, and messages whose content, contain every
    /// query token. Conversation hits come first, each group newest first.
    pub fn search(&self, query: &str, scope: Option<&str>) -> Result<Vec<SearchHit>> {
        let query_tokens = tokenize(query);
        let Some(first) = query_tokens.first() else {
            return Ok(Vec::new());
        };

        let (conversation_rows, message_rows) = {
            let conn = self.conn();
            let mut candidates = conn.prepare(
                "SELECT DISTINCT record_kind, record_id FROM search_tokens
                 WHERE instr(token, ?1) > 0 AND (?2 IS NULL OR conversation_id = ?2)",
            )?;
            let candidates = candidates
                .query_map(params![first, scope], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut tokens_of = conn.prepare(
                "SELECT token FROM search_tokens WHERE record_kind = ?1 AND record_id = ?2",
            )?;
            let mut conversation_rows = Vec::new();
            let mut message_rows = Vec::new();
            for (kind, record_id) in candidates {
                let tokens = tokens_of
                    .query_map(params![kind, record_id], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                if !matches_all(&query_tokens, &tokens) {
                    continue;
                }
                match RecordKind::parse(&kind) {
                    Some(RecordKind::Conversation) => conversation_rows.extend(
                        conn.query_row(
                            &format!(
                                "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"
                            ),
                            params![record_id],
                            conversation_row,
                        )
                        .optional()?,
                    ),
                    Some(RecordKind::Message) => message_rows.extend(
                        conn.query_row(
                            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                            params![record_id],
                            message_row,
                        )
                        .optional()?,
                    ),
                    None => warn!(target: "openagents.mirror", %kind, "unknown search record kind"),
                }
            }
            (conversation_rows, message_rows)
        };

        let mut stats = OpenStats::default();
        let mut conversations = Vec::new();
        for row in conversation_rows {
            let id = row.id.clone();
            match self.open_conversation(row, &mut stats) {
                Ok(conversation) => conversations.push(conversation),
                Err(error) => warn!(target: "openagents.mirror", conversation = %id, %error, "skipping unreadable search hit"),
            }
        }
        let mut messages = Vec::new();
        for row in message_rows {
            let id = row.id.clone();
            match self.open_message(row, &mut stats) {
                Ok(message) => messages.push(message),
                Err(error) => warn!(target: "openagents.mirror", message = %id, %error, "skipping unreadable search hit"),
            }
        }
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));

        Ok(conversations
            .into_iter()
            .map(|conversation| SearchHit::Conversation {
                conversation_id: conversation.id,
                title: conversation.title,
                updated_at: conversation.updated_at,
            })
            .chain(messages.into_iter().map(|message| SearchHit::Message {
                message_id: message.id,
                conversation_id: message.conversation_id,
                role: message.role,
                content: message.content,
                timestamp: message.timestamp,
            }))
            .collect())
    }

    fn seal_unit(
        &self,
        conversation: &Conversation,
        messages: &[Message],
    ) -> Result<(SealedConversation, Vec<SealedMessage>)> {
        if let Some(stray) = messages
            .iter()
            .find(|message| message.conversation_id != conversation.id)
        {
            return Err(StoreError::MismatchedConversation {
                message_id: stray.id.clone(),
                expected: conversation.id.clone(),
                found: stray.conversation_id.clone(),
            });
        }
        let sealed = self.seal_conversation(conversation)?;
        let sealed_messages = messages
            .iter()
            .map(|message| self.seal_message(message))
            .collect::<Result<Vec<_>>>()?;
        Ok((sealed, sealed_messages))
    }

    fn seal_conversation(&self, conversation: &Conversation) -> Result<SealedConversation> {
        Ok(SealedConversation {
            id: conversation.id.clone(),
            title: self.crypto.encrypt_str(&conversation.title)?,
            system_prompt: conversation
                .system_prompt
                .as_deref()
                .map(|prompt| self.crypto.encrypt_str(prompt))
                .transpose()?,
            model: conversation.model.clone(),
            pinned: conversation.pinned,
            thinking_enabled: conversation.thinking_enabled,
            created_at: conversation.created_at.timestamp_millis(),
            updated_at: conversation.updated_at.timestamp_millis(),
            tokens: tokenize(&conversation.title),
        })
    }

    fn seal_message(&self, message: &Message) -> Result<SealedMessage> {
        Ok(SealedMessage {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            role: message.role,
            content: self.crypto.encrypt_str(&message.content)?,
            thinking_content: message
                .thinking_content
                .as_deref()
                .map(|thinking| self.crypto.encrypt_str(thinking))
                .transpose()?,
            model_used: message.model_used.clone(),
            usage_tokens: message
                .usage_tokens
                .and_then(|tokens| i64::try_from(tokens).ok()),
            interrupted: message.interrupted,
            timestamp: message.timestamp.timestamp_millis(),
            tokens: tokenize(&message.content),
        })
    }

    fn commit_unit(
        &self,
        conversation: Option<&SealedConversation>,
        messages: &[SealedMessage],
        checkpoint: &mut dyn FnMut(WriteStep) -> Result<()>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if let Some(conversation) = conversation {
            write_conversation(&tx, conversation)?;
            checkpoint(WriteStep::Conversation)?;
        }
        for (index, message) in messages.iter().enumerate() {
            write_message(&tx, message)?;
            checkpoint(WriteStep::Message(index))?;
        }
        checkpoint(WriteStep::Commit)?;
        tx.commit()?;
        Ok(())
    }

    fn open_text(&self, stored: &str, stats: &mut OpenStats) -> Result<String> {
        let opened = self.crypto.open_field(stored)?;
        if opened.legacy_plaintext {
            stats.legacy_fields += 1;
        }
        Ok(opened.text)
    }

    fn open_conversation(&self, row: ConversationRow, stats: &mut OpenStats) -> Result<Conversation> {
        let corrupt = |field| StoreError::Corrupt {
            kind: "conversation",
            id: row.id.clone(),
            field,
        };
        Ok(Conversation {
            title: self.open_text(&row.title, stats)?,
            system_prompt: row
                .system_prompt
                .as_deref()
                .map(|prompt| self.open_text(prompt, stats))
                .transpose()?,
            created_at: from_millis(row.created_at).ok_or_else(|| corrupt("created_at"))?,
            updated_at: from_millis(row.updated_at).ok_or_else(|| corrupt("updated_at"))?,
            model: row.model,
            pinned: row.pinned,
            thinking_enabled: row.thinking_enabled,
            id: row.id,
        })
    }

    fn open_message(&self, row: MessageRow, stats: &mut OpenStats) -> Result<Message> {
        let corrupt = |field| StoreError::Corrupt {
            kind: "message",
            id: row.id.clone(),
            field,
        };
        let role = Role::parse(&row.role).ok_or_else(|| corrupt("role"))?;
        let interrupted = match row.interrupted.as_deref() {
            None => None,
            Some(value) => Some(Interruption::parse(value).ok_or_else(|| corrupt("interrupted"))?),
        };
        Ok(Message {
            role,
            content: self.open_text(&row.content, stats)?,
            thinking_content: row
                .thinking_content
                .as_deref()
                .map(|thinking| self.open_text(thinking, stats))
                .transpose()?,
            timestamp: from_millis(row.timestamp).ok_or_else(|| corrupt("timestamp"))?,
            usage_tokens: row.usage_tokens.and_then(|tokens| u64::try_from(tokens).ok()),
            interrupted,
            model_used: row.model_used,
            conversation_id: row.conversation_id,
            id: row.id,
        })
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    if version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        info!(target: "openagents.mirror", from = version, to = SCHEMA_VERSION, "migrated local mirror schema");
    }
    Ok(())
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

fn skip(kind: RecordKind, id: String, error: &StoreError) -> SkippedRecord {
    warn!(
        target: "openagents.mirror",
        kind = kind.as_str(),
        %id,
        %error,
        "skipping unreadable record"
    );
    SkippedRecord {
        kind,
        id,
        reason: error.to_string(),
    }
}

// Upsert in place: `INSERT OR REPLACE` would delete the row first and cascade
// away its messages.
fn write_conversation(tx: &Transaction<'_>, conversation: &SealedConversation) -> Result<()> {
    tx.execute(
        "INSERT INTO conversations
            (id, title, system_prompt, model, pinned, thinking_enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            system_prompt = excluded.system_prompt,
            model = excluded.model,
            pinned = excluded.pinned,
            thinking_enabled = excluded.thinking_enabled,
            updated_at = excluded.updated_at",
        params![
            conversation.id,
            conversation.title,
            conversation.system_prompt,
            conversation.model,
            conversation.pinned,
            conversation.thinking_enabled,
            conversation.created_at,
            conversation.updated_at,
        ],
    )?;
    index_record(
        tx,
        RecordKind::Conversation,
        &conversation.id,
        &conversation.id,
        &conversation.tokens,
    )
}

fn write_message(tx: &Transaction<'_>, message: &SealedMessage) -> Result<()> {
    let parent_exists = tx
        .query_row(
            "SELECT 1 FROM conversations WHERE id = ?1",
            params![message.conversation_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !parent_exists {
        return Err(StoreError::UnknownConversation(
            message.conversation_id.clone(),
        ));
    }
    tx.execute(
        "INSERT INTO messages
            (id, conversation_id, role, content, thinking_content, model_used, usage_tokens, interrupted, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            conversation_id = excluded.conversation_id,
            role = excluded.role,
            content = excluded.content,
            thinking_content = excluded.thinking_content,
            model_used = excluded.model_used,
            usage_tokens = excluded.usage_tokens,
            interrupted = excluded.interrupted,
            timestamp = excluded.timestamp",
        params![
            message.id,
            message.conversation_id,
            message.role.as_str(),
            message.content,
            message.thinking_content,
            message.model_used,
            message.usage_tokens,
            message.interrupted.map(Interruption::as_str),
            message.timestamp,
        ],
    )?;
    tx.execute(
        "UPDATE conversations SET updated_at = MAX(updated_at, ?2) WHERE id = ?1",
        params![message.conversation_id, message.timestamp],
    )?;
    index_record(
        tx,
        RecordKind::Message,
        &message.id,
        &message.conversation_id,
        &message.tokens,
    )
}

fn index_record(
    tx: &Transaction<'_>,
    kind: RecordKind,
    record_id: &str,
    conversation_id: &str,
    tokens: &[String],
) -> Result<()> {
    tx.execute(
        "DELETE FROM search_tokens WHERE record_kind = ?1 AND record_id = ?2",
        params![kind.as_str(), record_id],
    )?;
    let mut insert = tx.prepare_cached(
        "INSERT OR IGNORE INTO search_tokens (record_kind, record_id, conversation_id, token)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for token in tokens {
        insert.execute(params![kind.as_str(), record_id, conversation_id, token])?;
    }
    Ok(())
}
