// # File KV Store
//
// Embedded file-backed implementation of Persister with crash recovery.
//
// ## Purpose
//
// Backs the domains that live outside the relational database: SMI results,
// test profiles and the remote preference cache. One JSON file per domain.
//
// ## Crash Recovery
//
// - Atomic writes: write-then-rename
// - Automatic backup: keeps `.backup` of the last known good file
// - Corruption detection: falls back to the backup, then to empty state
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "domain": "smi_results",
//   "records": {
//     "run-42": {
//       "value": { "passing": 17 },
//       "updated_at": "2025-01-09T12:00:00Z"
//     }
//   }
// }
// ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::Error;
use crate::traits::persister::{Domain, Persister};

/// File format version
const KV_FILE_VERSION: &str = "1.0";

/// A stored record with its write timestamp
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct FileRecord {
    value: serde_json::Value,
    updated_at: chrono::DateTime<chrono::Utc>,
}

/// Serializable file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct KvFileFormat {
    version: String,
    domain: Domain,
    records: HashMap<String, FileRecord>,
}

/// Internal state
#[derive(Debug)]
struct FileState {
    records: HashMap<String, FileRecord>,
    dirty: bool,
}

/// Why a load failed
enum LoadFailure {
    /// The file exists but does not parse
    Corrupt(String),
    /// The file could not be read
    Unreadable(Error),
}

/// File-based persister with crash recovery
///
/// Writes go to disk before the call returns. `close()` flushes anything a
/// failed write left dirty.
///
/// # Example
///
/// ```rust,no_run
/// use meshplane_core::persister::FileKvStore;
/// use meshplane_core::traits::{Domain, Persister};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileKvStore::open("/var/lib/meshplane/smi_results.json", Domain::SmiResults).await?;
///     store.put("run-42", &serde_json::json!({ "passing": 17 })).await?;
///     store.close().await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileKvStore {
    domain: Domain,
    path: PathBuf,
    state: RwLock<FileState>,
    /// Serializes temp-file writes and renames
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl FileKvStore {
    /// Create or load a file store
    ///
    /// This will:
    /// 1. Create parent directories if needed
    /// 2. Load the existing file
    /// 3. If it is corrupted, load the backup
    /// 4. If both fail to parse, start empty
    pub async fn open<P: AsRef<Path>>(path: P, domain: Domain) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::persister(format!(
                    "Failed to create data directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let records = Self::load_with_recovery(&path).await?;

        Ok(Self {
            domain,
            path,
            state: RwLock::new(FileState {
                records,
                dirty: false,
            }),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_with_recovery(path: &Path) -> Result<HashMap<String, FileRecord>, Error> {
        match Self::load(path).await {
            Ok(records) => {
                tracing::debug!("Loaded {}: {} records", path.display(), records.len());
                Ok(records)
            }
            Err(LoadFailure::Unreadable(e)) => Err(e),
            Err(LoadFailure::Corrupt(reason)) => {
                tracing::warn!(
                    "Store file {} appears corrupted: {}. Attempting recovery from backup.",
                    path.display(),
                    reason
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No backup file found. Starting with empty state.");
                    return Ok(HashMap::new());
                }

                match Self::load(&backup_path).await {
                    Ok(records) => {
                        tracing::info!("Recovered {} records from backup", records.len());
                        if let Err(e) = fs::copy(&backup_path, path).await {
                            tracing::error!("Failed to restore store file from backup: {}", e);
                        }
                        Ok(records)
                    }
                    Err(LoadFailure::Corrupt(reason)) => {
                        tracing::error!(
                            "Backup also corrupted: {}. Starting with empty state.",
                            reason
                        );
                        Ok(HashMap::new())
                    }
                    Err(LoadFailure::Unreadable(e)) => Err(e),
                }
            }
        }
    }

    async fn load(path: &Path) -> Result<HashMap<String, FileRecord>, LoadFailure> {
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            LoadFailure::Unreadable(Error::persister(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        })?;

        let file: KvFileFormat =
            serde_json::from_str(&content).map_err(|e| LoadFailure::Corrupt(e.to_string()))?;

        if file.version != KV_FILE_VERSION {
            tracing::warn!(
                "Store file version mismatch: expected {}, got {}. Attempting to load anyway.",
                KV_FILE_VERSION,
                file.version
            );
        }

        Ok(file.records)
    }

    /// Write the current records to disk atomically
    async fn write_file(&self) -> Result<(), Error> {
        let _write = self.write_lock.lock().await;

        let json = {
            let state = self.state.read().await;
            let file = KvFileFormat {
                version: KV_FILE_VERSION.to_string(),
                domain: self.domain,
                records: state.records.clone(),
            };
            serde_json::to_string_pretty(&file)
                .map_err(|e| Error::persister(format!("Failed to serialize {}: {}", self.domain, e)))?
        };

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::persister(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::persister(format!("Failed to write {}: {}", temp_path.display(), e))
            })?;
            file.sync_all().await.map_err(|e| {
                Error::persister(format!("Failed to sync {}: {}", temp_path.display(), e))
            })?;
        }

        if self.path.exists() {
            let backup_path = Self::backup_path(&self.path);
            if let Err(e) = fs::copy(&self.path, &backup_path).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::persister(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        self.state.write().await.dirty = false;

        tracing::trace!("Store written: {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::persister(format!("{} persister is closed", self.domain)));
        }
        Ok(())
    }
}

#[async_trait]
impl Persister for FileKvStore {
    fn domain(&self) -> Domain {
        self.domain
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, Error> {
        self.ensure_open()?;
        let state = self.state.read().await;
        Ok(state.records.get(key).map(|r| r.value.clone()))
    }

    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<(), Error> {
        self.ensure_open()?;
        {
            let mut state = self.state.write().await;
            state.records.insert(
                key.to_string(),
                FileRecord {
                    value: value.clone(),
                    updated_at: chrono::Utc::now(),
                },
            );
            state.dirty = true;
        }

        self.write_file().await
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.ensure_open()?;
        {
            let mut state = self.state.write().await;
            if state.records.remove(key).is_none() {
                return Ok(());
            }
            state.dirty = true;
        }

        self.write_file().await
    }

    async fn list_keys(&self) -> Result<Vec<String>, Error> {
        self.ensure_open()?;
        let state = self.state.read().await;
        Ok(state.records.keys().cloned().collect())
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let dirty = self.state.read().await.dirty;
        if dirty {
            self.write_file().await?;
        }

        tracing::debug!("Closed {} store at {}", self.domain, self.path.display());
        Ok(())
    }
}
