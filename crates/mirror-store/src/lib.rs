//! Encrypted local mirror of gateway conversations.
//!
//! Conversation titles, system prompts, message bodies, and reasoning text are
//! sealed with a per-install master key kept in the host secret store. A
//! plaintext token index sits beside the sealed rows so search never needs to
//! decrypt.

#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

pub mod crypto;
pub mod model;
pub mod search;
pub mod secrets;
pub mod store;

pub use crypto::{CryptoError, ENVELOPE_PREFIX, EncryptedRecord, EncryptionService, OpenedField};
pub use model::{
    Conversation, ConversationWithMessages, Interruption, LoadReport, Message, RecordKind, Role,
    SearchHit, SkippedRecord,
};
pub use search::{matches_all, tokenize};
pub use secrets::{
    CredentialVault, KeyringSecretStore, MemorySecretStore, SecretStore, SecretStoreError,
};
pub use store::{MirrorStore, SCHEMA_VERSION, StoreError};
