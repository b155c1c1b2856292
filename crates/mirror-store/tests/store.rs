#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use openagents_mirror_store::{
    Conversation, EncryptionService, Interruption, MemorySecretStore, Message, MirrorStore,
    RecordKind, Role, SearchHit,
};
use tempfile::TempDir;

const SERVICE: &str = "openagents.mirror.test";

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_780_000_000 + seconds, 0).expect("timestamp")
}

fn crypto(secrets: &MemorySecretStore) -> Arc<EncryptionService> {
    Arc::new(EncryptionService::new(Arc::new(secrets.clone()), SERVICE))
}

fn seed(store: &MirrorStore) -> Result<()> {
    let mut refactor = Conversation::new("c-refactor", "Refactor planning", at(0));
    refactor.model = Some("gpt-large".to_string());
    store.upsert_conversation_with_messages(
        &refactor,
        &[
            Message::new("m1", "c-refactor", Role::User, "please refactor this loop", at(10)),
            Message::new(
                "m2",
                "c-refactor",
                Role::Assistant,
                "Here is the refactored loop",
                at(20),
            ),
        ],
    )?;

    let python = Conversation::new("c-python", "Scripting help", at(5));
    store.upsert_conversation_with_messages(
        &python,
        &[
            Message::new("m3", "c-python", Role::User, "Python is fun", at(30)),
            Message::new(
                "m4",
                "c-python",
                Role::Assistant,
                "Let us refactor the python code",
                at(40),
            ),
        ],
    )?;
    Ok(())
}

fn message_ids(hits: &[SearchHit]) -> Vec<&str> {
    hits.iter()
        .filter_map(|hit| match hit {
            SearchHit::Message { message_id, .. } => Some(message_id.as_str()),
            SearchHit::Conversation { .. } => None,
        })
        .collect()
}

#[test]
fn records_survive_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("mirror.db");
    let secrets = MemorySecretStore::new();
    {
        let store = MirrorStore::open(&path, crypto(&secrets))?;
        seed(&store)?;
    }

    let store = MirrorStore::open(&path, crypto(&secrets))?;
    let report = store.load_all()?;
    assert!(report.skipped.is_empty());
    assert_eq!(report.legacy_fields, 0);

    let ids: Vec<&str> = report
        .conversations
        .iter()
        .map(|entry| entry.conversation.id.as_str())
        .collect();
    // Message timestamps bump the parent, so c-python (latest at 40s) leads.
    assert_eq!(ids, ["c-python", "c-refactor"]);

    let refactor = &report.conversations[1];
    assert_eq!(refactor.conversation.title, "Refactor planning");
    assert_eq!(refactor.conversation.model.as_deref(), Some("gpt-large"));
    assert_eq!(refactor.conversation.updated_at, at(20));
    let contents: Vec<&str> = refactor.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["please refactor this loop", "Here is the refactored loop"]);
    Ok(())
}

#[test]
fn search_matches_prefixes_and_requires_every_token() -> Result<()> {
    let store = MirrorStore::open_in_memory(crypto(&MemorySecretStore::new()))?;
    seed(&store)?;

    let hits = store.search("refact", None)?;
    assert_eq!(
        hits.first(),
        Some(&SearchHit::Conversation {
            conversation_id: "c-refactor".to_string(),
            title: "Refactor planning".to_string(),
            updated_at: at(20),
        })
    );
    assert_eq!(message_ids(&hits), ["m4", "m2", "m1"]);

    let both = store.search("python refactor", None)?;
    assert_eq!(message_ids(&both), ["m4"]);
    assert!(
        both.iter()
            .all(|hit| !matches!(hit, SearchHit::Conversation { .. }))
    );

    assert!(store.search("   ", None)?.is_empty());
    assert!(store.search("kotlin", None)?.is_empty());
    Ok(())
}

#[test]
fn search_can_be_scoped_to_one_conversation() -> Result<()> {
    let store = MirrorStore::open_in_memory(crypto(&MemorySecretStore::new()))?;
    seed(&store)?;

    let hits = store.search("refactor", Some("c-refactor"))?;
    assert!(hits.iter().all(|hit| hit.conversation_id() == "c-refactor"));
    assert_eq!(message_ids(&hits), ["m2", "m1"]);
    Ok(())
}

#[test]
fn edits_reindex_search_tokens() -> Result<()> {
    let store = MirrorStore::open_in_memory(crypto(&MemorySecretStore::new()))?;
    seed(&store)?;

    let mut edited = Message::new("m3", "c-python", Role::User, "Kotlin is fun", at(30));
    edited.usage_tokens = Some(12);
    store.upsert_message(&edited)?;

    assert!(message_ids(&store.search("kotlin", None)?).contains(&"m3"));
    assert!(!message_ids(&store.search("python", None)?).contains(&"m3"));
    let loaded = store.load_conversation("c-python")?.expect("conversation");
    assert_eq!(loaded.messages[0].usage_tokens, Some(12));
    Ok(())
}

#[test]
fn deleting_a_conversation_cascades() -> Result<()> {
    let store = MirrorStore::open_in_memory(crypto(&MemorySecretStore::new()))?;
    seed(&store)?;

    assert!(store.delete_conversation("c-refactor")?);
    assert!(!store.delete_conversation("c-refactor")?);
    assert!(store.load_conversation("c-refactor")?.is_none());
    let hits = store.search("refactor", None)?;
    assert!(hits.iter().all(|hit| hit.conversation_id() == "c-python"));

    assert!(store.delete_message("m4")?);
    assert!(store.search("refactor", None)?.is_empty());
    let python = store.load_conversation("c-python")?.expect("conversation");
    assert_eq!(python.messages.len(), 1);
    Ok(())
}

#[test]
fn interrupted_replies_keep_their_metadata() -> Result<()> {
    let store = MirrorStore::open_in_memory(crypto(&MemorySecretStore::new()))?;
    let conversation = Conversation::new("c1", "Streaming", at(0));
    let mut partial = Message::new("m1", "c1", Role::Assistant, "half an ans", at(1));
    partial.interrupted = Some(Interruption::TimedOut);
    partial.thinking_content = Some("considering".to_string());
    partial.model_used = Some("gpt-small".to_string());
    store.upsert_conversation_with_messages(&conversation, &[partial.clone()])?;

    let loaded = store.load_conversation("c1")?.expect("conversation");
    assert_eq!(loaded.messages, vec![partial]);
    Ok(())
}

#[test]
fn losing_the_key_skips_records_instead_of_failing() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("mirror.db");
    let secrets = MemorySecretStore::new();
    {
        let store = MirrorStore::open(&path, crypto(&secrets))?;
        seed(&store)?;
        store.crypto().delete_key()?;
    }

    let store = MirrorStore::open(&path, crypto(&secrets))?;
    let fresh = Conversation::new("c-new", "After reset", at(100));
    store.upsert_conversation(&fresh)?;

    let report = store.load_all()?;
    assert_eq!(report.conversations.len(), 1);
    assert_eq!(report.conversations[0].conversation.title, "After reset");
    let skipped_conversations = report
        .skipped
        .iter()
        .filter(|record| record.kind == RecordKind::Conversation)
        .count();
    let skipped_messages = report
        .skipped
        .iter()
        .filter(|record| record.kind == RecordKind::Message)
        .count();
    assert_eq!(skipped_conversations, 2);
    assert_eq!(skipped_messages, 4);

    // Tokens stay plaintext, so search still finds the record ids; unreadable
    // rows are dropped from the hits.
    assert!(store.search("refactor", None)?.is_empty());
    Ok(())
}
