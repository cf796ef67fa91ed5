//! Key/value store consumed by the broker.
//!
//! The core never owns storage. It talks to a [`KvStore`] handle passed in by
//! the process entry point and uses three key namespaces:
//!
//! - `oauth_state/<state>` - pending auth requests, single use
//! - `sessions/<token>` - logged-in sessions
//! - `apps/<server>/<broker-host>` - cached fediverse app registrations
//!
//! Expiry is a store capability: records written with [`KvStore::set_with_ttl`]
//! must stop being visible once their TTL has elapsed.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Key builders for the namespaces the broker uses.
pub mod keys {
    pub const AUTH_REQUEST_PREFIX: &str = "oauth_state/";
    pub const SESSION_PREFIX: &str = "sessions/";
    pub const APP_PREFIX: &str = "apps/";

    pub fn auth_request(state: &str) -> String {
        format!("{}{}", AUTH_REQUEST_PREFIX, state)
    }

    pub fn session(token: &str) -> String {
        format!("{}{}", SESSION_PREFIX, token)
    }

    pub fn app(server_domain: &str, broker_host: &str) -> String {
        format!("{}{}/{}", APP_PREFIX, server_domain, broker_host)
    }
}

/// Error type for store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Invalid stored value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Byte-keyed store implemented by collaborators.
///
/// Implementations can be in-memory (single process) or backed by a file or
/// database. The broker only assumes that a `set` followed by a `get` on the
/// same key from the same request observes the value.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value with no expiry.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Write a value that the store must stop returning after `ttl`.
    ///
    /// Backends without expiry support fall back to [`KvStore::set`].
    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let _ = ttl;
        self.set(key, value).await
    }

    /// List keys under `prefix`, in ascending order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Read and remove a value.
    ///
    /// The default is `get` then `delete`; backends that can do this
    /// atomically should override it.
    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.get(key).await?;
        if value.is_some() {
            self.delete(key).await?;
        }
        Ok(value)
    }
}

/// Serialize `value` as JSON and store it, optionally with a TTL.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    match ttl {
        Some(ttl) => store.set_with_ttl(key, bytes, ttl).await,
        None => store.set(key, bytes).await,
    }
}

/// Read a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => decode(key, &bytes).map(Some),
        None => Ok(None),
    }
}

/// Read and remove a JSON value.
pub async fn take_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.take(key).await? {
        Some(bytes) => decode(key, &bytes).map(Some),
        None => Ok(None),
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }
}

/// In-memory implementation of [`KvStore`].
///
/// Suitable for single-process deployments and tests. Expired entries are
/// invisible to reads and are dropped lazily or by [`MemoryStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired store entries");
        }
        removed
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Leaves a value written since the check above in place
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let keys: BTreeSet<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .remove(key)
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(_, entry)| entry.value))
    }
}
