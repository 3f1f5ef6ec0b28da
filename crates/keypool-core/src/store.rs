use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::key::{ApiKey, KeyId};

/// Error surfaced by a persistence collaborator. Kept opaque: the pool
/// only relays the message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// CRUD seam to the encrypted key store, which lives outside this crate.
/// Secrets pass through opaquely in both directions.
pub trait KeyStore: Send + Sync {
    fn load_keys(&self) -> Result<Vec<ApiKey>, StoreError>;
    fn save_key(&self, key: &ApiKey) -> Result<(), StoreError>;
    fn delete_key(&self, id: KeyId) -> Result<(), StoreError>;
}

/// In-memory store for tests and ephemeral pools.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    inner: Mutex<HashMap<KeyId, ApiKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock_inner().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_inner().is_empty()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, HashMap<KeyId, ApiKey>> {
        self.inner.lock().expect("memory store lock is not poisoned")
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_keys(&self) -> Result<Vec<ApiKey>, StoreError> {
        Ok(self.lock_inner().values().cloned().collect())
    }

    fn save_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        self.lock_inner().insert(key.id, key.clone());
        Ok(())
    }

    fn delete_key(&self, id: KeyId) -> Result<(), StoreError> {
        self.lock_inner().remove(&id);
        Ok(())
    }
}
