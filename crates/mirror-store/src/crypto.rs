//! Authenticated encryption for sensitive mirror fields.
//!
//! The master key is 32 random bytes kept base64-encoded in the host
//! [`SecretStore`]. It is loaded (or generated) on first use and cached for
//! the life of the service. Every call draws a fresh 24-byte XChaCha20 nonce,
//! wide enough that random nonces do not collide under one key.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use thiserror::Error;
use tracing::{info, warn};

use crate::secrets::{SecretStore, SecretStoreError};

/// Prefix of every sealed field; anything else is legacy plaintext.
pub const ENVELOPE_PREFIX: &str = "enc:v1:";
pub const MASTER_KEY_ACCOUNT: &str = "master-key";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key unavailable: {0}")]
    KeyUnavailable(#[from] SecretStoreError),
    #[error("stored encryption key is invalid: {0}")]
    InvalidKey(String),
    #[error("failed to encrypt payload")]
    Encrypt,
    #[error("ciphertext failed authentication")]
    Authentication,
    #[error("malformed encrypted envelope: {0}")]
    MalformedEnvelope(String),
    #[error("decrypted payload is not valid utf-8")]
    InvalidUtf8,
}

#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedRecord {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for EncryptedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedRecord")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

impl EncryptedRecord {
    /// `enc:v1:<nonce b64url>:<ciphertext b64url>`
    #[must_use]
    pub fn to_envelope(&self) -> String {
        format!(
            "{ENVELOPE_PREFIX}{}:{}",
            URL_SAFE_NO_PAD.encode(self.nonce),
            URL_SAFE_NO_PAD.encode(&self.ciphertext)
        )
    }

    pub fn parse_envelope(stored: &str) -> Result<Self, CryptoError> {
        let body = stored
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| CryptoError::MalformedEnvelope("missing enc:v1 prefix".to_string()))?;
        let mut parts = body.split(':');
        let (Some(nonce_b64), Some(ciphertext_b64), None) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(CryptoError::MalformedEnvelope(
                "expected nonce and ciphertext".to_string(),
            ));
        };

        let nonce_raw = URL_SAFE_NO_PAD
            .decode(nonce_b64.as_bytes())
            .map_err(|error| CryptoError::MalformedEnvelope(format!("nonce: {error}")))?;
        let nonce: [u8; NONCE_LEN] = nonce_raw.try_into().map_err(|raw: Vec<u8>| {
            CryptoError::MalformedEnvelope(format!("nonce is {} bytes", raw.len()))
        })?;
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64.as_bytes())
            .map_err(|error| CryptoError::MalformedEnvelope(format!("ciphertext: {error}")))?;
        Ok(Self { nonce, ciphertext })
    }
}

#[must_use]
pub fn is_sealed(stored: &str) -> bool {
    stored.starts_with(ENVELOPE_PREFIX)
}

/// Plaintext of a stored field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedField {
    pub text: String,
    /// Written before encryption was enabled; the next write seals it.
    pub legacy_plaintext: bool,
}

pub struct EncryptionService {
    secrets: Arc<dyn SecretStore>,
    service: String,
    cipher: Mutex<Option<XChaCha20Poly1305>>,
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("service", &self.service)
            .field("key_loaded", &self.cached().is_some())
            .finish()
    }
}

impl EncryptionService {
    pub fn new(secrets: Arc<dyn SecretStore>, service: impl Into<String>) -> Self {
        Self {
            secrets,
            service: service.into(),
            cipher: Mutex::new(None),
        }
    }

    fn cached(&self) -> MutexGuard<'_, Option<XChaCha20Poly1305>> {
        self.cipher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, CryptoError> {
        let mut cached = self.cached();
        if let Some(cipher) = cached.as_ref() {
            return Ok(cipher.clone());
        }
        let key = match self.secrets.get(&self.service, MASTER_KEY_ACCOUNT)? {
            Some(encoded) => decode_key(&encoded)?,
            None => {
                let key: [u8; KEY_LEN] = rand::random();
                self.secrets
                    .set(&self.service, MASTER_KEY_ACCOUNT, &STANDARD.encode(key))?;
                info!(target: "openagents.mirror", service = %self.service, "generated local store master key");
                key
            }
        };
        let cipher = XChaCha20Poly1305::new_from_slice(&key)
            .map_err(|error| CryptoError::InvalidKey(error.to_string()))?;
        *cached = Some(cipher.clone());
        Ok(cipher)
    }

    /// Load or create the master key now instead of on the first write.
    pub fn ensure_key(&self) -> Result<(), CryptoError> {
        self.cipher().map(|_| ())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedRecord, CryptoError> {
        let cipher = self.cipher()?;
        let nonce: [u8; NONCE_LEN] = rand::random();
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        Ok(EncryptedRecord { nonce, ciphertext })
    }

    pub fn decrypt(&self, record: &EncryptedRecord) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher()?;
        cipher
            .decrypt(XNonce::from_slice(&record.nonce), record.ciphertext.as_slice())
            .map_err(|_| CryptoError::Authentication)
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        Ok(self.encrypt(plaintext.as_bytes())?.to_envelope())
    }

    /// Open a sealed envelope. Unsealed input is an error here; see
    /// [`open_field`](Self::open_field) for the legacy path.
    pub fn decrypt_str(&self, stored: &str) -> Result<String, CryptoError> {
        let record = EncryptedRecord::parse_envelope(stored)?;
        String::from_utf8(self.decrypt(&record)?).map_err(|_| CryptoError::InvalidUtf8)
    }

    /// Read a stored field, passing legacy plaintext through.
    ///
    /// A field carrying the envelope prefix that fails to authenticate is
    /// always an error.
    pub fn open_field(&self, stored: &str) -> Result<OpenedField, CryptoError> {
        if !is_sealed(stored) {
            warn!(
                target: "openagents.mirror",
                "read unencrypted legacy field; it will be encrypted on the next write"
            );
            return Ok(OpenedField {
                text: stored.to_string(),
                legacy_plaintext: true,
            });
        }
        Ok(OpenedField {
            text: self.decrypt_str(stored)?,
            legacy_plaintext: false,
        })
    }

    /// Destroy the master key.
    ///
    /// This is irreversible data loss, not a logout: every record sealed under
    /// the old key becomes permanently undecryptable. The next write
    /// generates a new key.
    pub fn delete_key(&self) -> Result<(), CryptoError> {
        let mut cached = self.cached();
        self.secrets.delete(&self.service, MASTER_KEY_ACCOUNT)?;
        *cached = None;
        warn!(target: "openagents.mirror", service = %self.service, "local store master key deleted");
        Ok(())
    }
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let raw = STANDARD
        .decode(encoded.trim().as_bytes())
        .or_else(|_| URL_SAFE_NO_PAD.decode(encoded.trim().as_bytes()))
        .map_err(|error| CryptoError::InvalidKey(format!("invalid base64: {error}")))?;
    raw.try_into()
        .map_err(|raw: Vec<u8>| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", raw.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemorySecretStore;
    use quickcheck::quickcheck;

    fn service() -> (MemorySecretStore, EncryptionService) {
        let secrets = MemorySecretStore::new();
        let service = EncryptionService::new(Arc::new(secrets.clone()), "openagents.test");
        (secrets, service)
    }

    #[test]
    fn same_plaintext_gets_fresh_nonces() -> Result<(), CryptoError> {
        let (_, service) = service();
        let first = service.encrypt(b"hello")?;
        let second = service.encrypt(b"hello")?;
        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
        assert_eq!(service.decrypt(&first)?, b"hello");
        Ok(())
    }

    #[test]
    fn key_survives_a_new_service_instance() -> Result<(), CryptoError> {
        let (secrets, first) = service();
        let sealed = first.encrypt_str("persisted")?;
        assert!(secrets.get("openagents.test", MASTER_KEY_ACCOUNT)?.is_some());

        let second = EncryptionService::new(Arc::new(secrets), "openagents.test");
        assert_eq!(second.decrypt_str(&sealed)?, "persisted");
        Ok(())
    }

    #[test]
    fn deleting_the_key_orphans_existing_records() -> Result<(), CryptoError> {
        let (secrets, service) = service();
        let sealed = service.encrypt_str("gone forever")?;
        service.delete_key()?;
        assert!(secrets.is_empty());

        assert!(matches!(
            service.decrypt_str(&sealed),
            Err(CryptoError::Authentication)
        ));
        Ok(())
    }

    #[test]
    fn legacy_plaintext_passes_through_but_tampered_envelopes_fail() -> Result<(), CryptoError> {
        let (_, service) = service();
        let legacy = service.open_field("written before encryption")?;
        assert!(legacy.legacy_plaintext);
        assert_eq!(legacy.text, "written before encryption");

        let sealed = service.encrypt_str("secret")?;
        let tampered = format!("{sealed}A");
        assert!(service.open_field(&tampered).is_err());
        assert!(matches!(
            service.open_field("enc:v1:only-one-part"),
            Err(CryptoError::MalformedEnvelope(_))
        ));
        Ok(())
    }

    #[test]
    fn rejects_stored_key_of_wrong_length() {
        let secrets = MemorySecretStore::new();
        secrets
            .set("openagents.test", MASTER_KEY_ACCOUNT, &STANDARD.encode([1u8; 16]))
            .expect("seed key");
        let service = EncryptionService::new(Arc::new(secrets), "openagents.test");
        assert!(matches!(
            service.encrypt(b"x"),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    quickcheck! {
        fn round_trips_any_plaintext(plaintext: Vec<u8>) -> bool {
            let (_, service) = service();
            service
                .encrypt(&plaintext)
                .and_then(|record| service.decrypt(&record))
                .is_ok_and(|opened| opened == plaintext)
        }

        fn any_single_bit_flip_fails_to_decrypt(plaintext: Vec<u8>, position: usize, in_nonce: bool) -> bool {
            let (_, service) = service();
            let Ok(mut record) = service.encrypt(&plaintext) else {
                return false;
            };
            if in_nonce {
                let bit = position % (NONCE_LEN * 8);
                record.nonce[bit / 8] ^= 1 << (bit % 8);
            } else {
                let bit = position % (record.ciphertext.len() * 8);
                record.ciphertext[bit / 8] ^= 1 << (bit % 8);
            }
            matches!(service.decrypt(&record), Err(CryptoError::Authentication))
        }
    }
}
