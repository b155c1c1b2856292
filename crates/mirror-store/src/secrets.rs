//! Secret-storage capability.
//!
//! Holds only the store master key and gateway credentials, never message
//! content.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store rejected {account}: {message}")]
    Rejected { account: String, message: String },
}

/// `(service, account) -> value` storage provided by the host.
pub trait SecretStore: Send + Sync {
    fn get(&self, service: &str, account: &str) -> Result<Option<String>, SecretStoreError>;
    fn set(&self, service: &str, account: &str, value: &str) -> Result<(), SecretStoreError>;
    /// Deleting a missing entry is not an error.
    fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError>;
}

/// OS credential store (Keychain, Credential Manager, Secret Service).
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringSecretStore;

impl KeyringSecretStore {
    fn entry(service: &str, account: &str) -> Result<keyring::Entry, SecretStoreError> {
        keyring::Entry::new(service, account).map_err(|error| SecretStoreError::Rejected {
            account: account.to_string(),
            message: error.to_string(),
        })
    }
}

fn keyring_error(account: &str, error: keyring::Error) -> SecretStoreError {
    match error {
        keyring::Error::PlatformFailure(inner) | keyring::Error::NoStorageAccess(inner) => {
            SecretStoreError::Unavailable(inner.to_string())
        }
        other => SecretStoreError::Rejected {
            account: account.to_string(),
            message: other.to_string(),
        },
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<String>, SecretStoreError> {
        match Self::entry(service, account)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(keyring_error(account, error)),
        }
    }

    fn set(&self, service: &str, account: &str, value: &str) -> Result<(), SecretStoreError> {
        Self::entry(service, account)?
            .set_password(value)
            .map_err(|error| keyring_error(account, error))
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        match Self::entry(service, account)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(keyring_error(account, error)),
        }
    }
}

/// Process-local store for tests and headless runs.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    entries: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<(String, String), String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<String>, SecretStoreError> {
        Ok(self
            .entries()
            .get(&(service.to_string(), account.to_string()))
            .cloned())
    }

    fn set(&self, service: &str, account: &str, value: &str) -> Result<(), SecretStoreError> {
        self.entries()
            .insert((service.to_string(), account.to_string()), value.to_string());
        Ok(())
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        self.entries()
            .remove(&(service.to_string(), account.to_string()));
        Ok(())
    }
}

const CREDENTIAL_ACCOUNT_PREFIX: &str = "gateway-token:";

/// Gateway tokens keyed by gateway host.
#[derive(Clone)]
pub struct CredentialVault {
    secrets: Arc<dyn SecretStore>,
    service: String,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl CredentialVault {
    pub fn new(secrets: Arc<dyn SecretStore>, service: impl Into<String>) -> Self {
        Self {
            secrets,
            service: service.into(),
        }
    }

    fn account(host: &str) -> String {
        format!("{CREDENTIAL_ACCOUNT_PREFIX}{}", host.trim().to_ascii_lowercase())
    }

    pub fn token(&self, host: &str) -> Result<Option<String>, SecretStoreError> {
        self.secrets.get(&self.service, &Self::account(host))
    }

    pub fn store_token(&self, host: &str, token: &str) -> Result<(), SecretStoreError> {
        debug!(%host, "storing gateway token");
        self.secrets.set(&self.service, &Self::account(host), token)
    }

    pub fn forget_token(&self, host: &str) -> Result<(), SecretStoreError> {
        self.secrets.delete(&self.service, &Self::account(host))
    }
}
