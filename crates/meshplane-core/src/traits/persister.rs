// # Persister Trait
//
// Defines the interface every domain-scoped storage unit implements.
//
// ## Purpose
//
// Each data domain (preferences, results, profiles, cluster objects, ...) is
// stored by its own persister. All persisters are composed behind a single
// `PersisterSet` handle that providers and the ingestion consumer share.
//
// ## Implementations
//
// - In-memory map: `MemoryKvStore`
// - Embedded file store with crash recovery: `FileKvStore`
// - Relational table on a shared SQLite handle: `SqliteTable`
//
// ## Usage
//
// ```rust,ignore
// use meshplane_core::traits::{Domain, Persister};
//
// let store = /* Persister implementation */;
// store.put("user-1", &serde_json::json!({ "theme": "dark" })).await?;
// let prefs = store.get("user-1").await?;
// store.close().await?;
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Data domains known to the persistence layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// User preferences owned by the local provider
    Preferences,
    /// Preferences pulled from remote authorities
    RemotePreferences,
    /// Service mesh conformance results
    SmiResults,
    /// Saved test configurations
    TestProfiles,
    /// Performance profiles
    PerformanceProfiles,
    /// Performance test results
    Results,
    /// Design patterns
    Patterns,
    /// Filters
    Filters,
    /// Applications
    Applications,
    /// Resources generated from patterns
    PatternResources,
    /// Cluster objects observed through the broker
    ClusterObjects,
    /// Cluster key-value pairs observed through the broker
    ClusterKeyValues,
}

/// Backing engine of a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// In-process map, not persistent
    Memory,
    /// Embedded file-backed key-value store
    File,
    /// Table on the shared relational handle
    Relational,
}

impl Domain {
    /// Every domain, in open order
    pub const ALL: [Domain; 12] = [
        Domain::Preferences,
        Domain::RemotePreferences,
        Domain::SmiResults,
        Domain::TestProfiles,
        Domain::PerformanceProfiles,
        Domain::Results,
        Domain::Patterns,
        Domain::Filters,
        Domain::Applications,
        Domain::PatternResources,
        Domain::ClusterObjects,
        Domain::ClusterKeyValues,
    ];

    /// Stable name, also used as file stem and table name
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Preferences => "preferences",
            Domain::RemotePreferences => "remote_preferences",
            Domain::SmiResults => "smi_results",
            Domain::TestProfiles => "test_profiles",
            Domain::PerformanceProfiles => "performance_profiles",
            Domain::Results => "results",
            Domain::Patterns => "patterns",
            Domain::Filters => "filters",
            Domain::Applications => "applications",
            Domain::PatternResources => "pattern_resources",
            Domain::ClusterObjects => "cluster_objects",
            Domain::ClusterKeyValues => "cluster_key_values",
        }
    }

    /// Which engine backs this domain in a default deployment
    pub fn backend(&self) -> Backend {
        match self {
            Domain::Preferences => Backend::Memory,
            Domain::RemotePreferences | Domain::SmiResults | Domain::TestProfiles => Backend::File,
            _ => Backend::Relational,
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for domain persister implementations
///
/// Records are JSON documents addressed by a string key.
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks. Writes
/// to the same key are serialized by the implementation's own primitive
/// (a lock or a transaction), never by callers.
///
/// # Lifecycle
///
/// - A persister is usable as soon as it is constructed
/// - `close()` flushes buffered writes and releases the backing store
/// - After `close()`, every other operation returns [`crate::Error::Persister`]
/// - Calling `close()` again is a no-op
#[async_trait]
pub trait Persister: Send + Sync {
    /// The domain this persister stores
    fn domain(&self) -> Domain;

    /// Whether the persister is still open
    fn is_open(&self) -> bool;

    /// Get a record
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))`: The stored document
    /// - `Ok(None)`: No record under this key
    /// - `Err(Error)`: Storage error or persister closed
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, crate::Error>;

    /// Create or replace a record
    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<(), crate::Error>;

    /// Delete a record (succeeds if it didn't exist)
    async fn delete(&self, key: &str) -> Result<(), crate::Error>;

    /// List all keys in the persister
    async fn list_keys(&self) -> Result<Vec<String>, crate::Error>;

    /// Flush pending writes and release the backing store
    async fn close(&self) -> Result<(), crate::Error>;
}
