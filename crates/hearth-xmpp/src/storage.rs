//! Storage boundary for instances that persist per-address data.
//!
//! The routing core never looks inside stored data; an instance stores and
//! fetches opaque XML fragments keyed by address and namespace. Backends
//! implement [`Storage`]. [`MemoryStorage`] is the in-process
//! implementation used in tests and development.

use async_trait::async_trait;
use dashmap::DashMap;
use jid::Jid;
use minidom::Element;
use thiserror::Error;
use tracing::debug;

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}

/// Persisted XML fragments, keyed by owning instance, host, address and
/// namespace.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch the fragment `address` stored under `namespace` on `host`.
    async fn get(
        &self,
        instance: &str,
        host: &str,
        address: &Jid,
        namespace: &str,
    ) -> Result<Option<Element>, StorageError>;

    /// Store `data` for `address` under `namespace`, replacing what was
    /// there. The host is the address's domain.
    async fn set(
        &self,
        instance: &str,
        address: &Jid,
        namespace: &str,
        data: Element,
    ) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StorageKey {
    instance: String,
    host: String,
    address: String,
    namespace: String,
}

impl StorageKey {
    fn new(instance: &str, host: &str, address: &Jid, namespace: &str) -> Result<Self, StorageError> {
        if namespace.is_empty() {
            return Err(StorageError::InvalidKey("empty namespace".to_string()));
        }
        Ok(Self {
            instance: instance.to_string(),
            host: host.to_ascii_lowercase(),
            address: address.to_bare().to_string(),
            namespace: namespace.to_string(),
        })
    }
}

/// In-memory [`Storage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<StorageKey, Element>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored fragments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(
        &self,
        instance: &str,
        host: &str,
        address: &Jid,
        namespace: &str,
    ) -> Result<Option<Element>, StorageError> {
        let key = StorageKey::new(instance, host, address, namespace)?;
        Ok(self.entries.get(&key).map(|e| e.value().clone()))
    }

    async fn set(
        &self,
        instance: &str,
        address: &Jid,
        namespace: &str,
        data: Element,
    ) -> Result<(), StorageError> {
        let host = address.domain().as_str().to_string();
        let key = StorageKey::new(instance, &host, address, namespace)?;
        debug!(instance = %instance, address = %key.address, namespace = %namespace, "Storing fragment");
        self.entries.insert(key, data);
        Ok(())
    }
}
