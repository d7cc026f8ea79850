// # Memory KV Store
//
// In-memory implementation of Persister.
//
// ## Purpose
//
// Backs the local provider's preference map and every domain of
// `PersisterSet::in_memory()`. Nothing survives a restart.
//
// ## When to Use
//
// - Local session preferences (rebuilt on login)
// - Testing environments
// - Embedding without a data directory

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::persister::{Domain, Persister};

/// In-memory persister
///
/// Stores records in a HashMap protected by a RwLock. Clones share storage.
///
/// # Example
///
/// ```rust,no_run
/// use meshplane_core::persister::MemoryKvStore;
/// use meshplane_core::traits::{Domain, Persister};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryKvStore::new(Domain::Preferences);
///
///     store.put("user-1", &serde_json::json!({ "theme": "dark" })).await?;
///     let prefs = store.get("user-1").await?;
///     assert!(prefs.is_some());
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryKvStore {
    domain: Domain,
    inner: Arc<RwLock<HashMap<String, serde_json::Value>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryKvStore {
    /// Create a new empty store for `domain`
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            inner: Arc::new(RwLock::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the number of records in the store
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Check if the store is empty
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::persister(format!("{} persister is closed", self.domain)));
        }
        Ok(())
    }
}

#[async_trait]
impl Persister for MemoryKvStore {
    fn domain(&self) -> Domain {
        self.domain
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, Error> {
        self.ensure_open()?;
        let guard = self.inner.read().await;
        Ok(guard.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<(), Error> {
        self.ensure_open()?;
        let mut guard = self.inner.write().await;
        guard.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.ensure_open()?;
        let mut guard = self.inner.write().await;
        guard.remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, Error> {
        self.ensure_open()?;
        let guard = self.inner.read().await;
        Ok(guard.keys().cloned().collect())
    }

    async fn close(&self) -> Result<(), Error> {
        // Nothing buffered; closing only fences further use
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryKvStore::new(Domain::Preferences);

        assert!(store.is_empty().await);

        store.put("user-1", &json!({ "theme": "dark" })).await.unwrap();
        assert_eq!(store.len().await, 1);

        let retrieved = store.get("user-1").await.unwrap();
        assert_eq!(retrieved, Some(json!({ "theme": "dark" })));

        store.delete("user-1").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_memory_store_list() {
        let store = MemoryKvStore::new(Domain::SmiResults);

        store.put("a", &json!(1)).await.unwrap();
        store.put("b", &json!(2)).await.unwrap();

        let mut keys = store.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_io() {
        let store = MemoryKvStore::new(Domain::Preferences);
        store.close().await.unwrap();

        assert!(!store.is_open());
        assert!(store.get("user-1").await.is_err());
        assert!(store.put("user-1", &json!({})).await.is_err());

        // Second close is a no-op
        assert!(store.close().await.is_ok());
    }
}
