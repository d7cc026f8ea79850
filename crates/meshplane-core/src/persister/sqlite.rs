// # SQLite Persistence
//
// Relational backend shared by the table-backed domains.
//
// ## Structure
//
// - `SqliteHandle`: the one connection, plus a migration gate
// - `SqliteTable`: a `Persister` for a single domain table on that handle
//
// ## Migration Gate
//
// The schema migration holds the gate exclusively. Every table operation
// takes the gate shared and fails until the migration has completed, so no
// read or write ever observes a half-built schema.
//
// ## Schema
//
// ```sql
// CREATE TABLE <domain> (
//     key        TEXT PRIMARY KEY NOT NULL,
//     value      TEXT NOT NULL,   -- JSON document
//     updated_at TEXT NOT NULL    -- RFC 3339
// );
// CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL);
// ```

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::persister::{Domain, Persister};

/// Current schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Migration progress of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Opened, schema not yet applied
    Pending,
    /// Schema applied
    Migrated { version: u32 },
    /// Connection released
    Closed,
}

#[derive(Debug)]
struct HandleInner {
    conn: Mutex<Option<Connection>>,
    gate: RwLock<MigrationState>,
    closed: AtomicBool,
}

/// Shared SQLite connection
///
/// Cloning is cheap; all clones refer to the same connection. Blocking
/// SQLite calls run on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct SqliteHandle {
    inner: Arc<HandleInner>,
}

impl SqliteHandle {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::persister(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        tracing::debug!("Opened relational store at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                conn: Mutex::new(Some(conn)),
                gate: RwLock::new(MigrationState::Pending),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Current migration state
    pub async fn state(&self) -> MigrationState {
        *self.inner.gate.read().await
    }

    /// Whether the connection is still held
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Create the tables for `domains` and record the schema version
    ///
    /// Idempotent: a second call returns the recorded version without
    /// touching the database.
    pub async fn migrate(&self, domains: &[Domain]) -> Result<u32, Error> {
        let mut gate = self.inner.gate.write().await;
        match *gate {
            MigrationState::Migrated { version } => return Ok(version),
            MigrationState::Closed => {
                return Err(Error::persister("Relational store is closed"));
            }
            MigrationState::Pending => {}
        }

        let tables: Vec<&'static str> = domains.iter().map(|d| d.as_str()).collect();
        let inner = Arc::clone(&self.inner);
        let version = tokio::task::spawn_blocking(move || -> Result<u32, Error> {
            let mut guard = inner.conn.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard
                .as_mut()
                .ok_or_else(|| Error::persister("Relational store is closed"))?;
            apply_schema(conn, &tables)
        })
        .await
        .map_err(|e| Error::persister(format!("Migration task failed: {}", e)))??;

        *gate = MigrationState::Migrated { version };
        tracing::info!("Relational schema at version {}", version);
        Ok(version)
    }

    /// Run `f` against the connection once the schema is in place
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Connection) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let gate = self.inner.gate.read().await;
        match *gate {
            MigrationState::Migrated { .. } => {}
            MigrationState::Pending => {
                return Err(Error::persister("Relational schema has not been migrated"));
            }
            MigrationState::Closed => {
                return Err(Error::persister("Relational store is closed"));
            }
        }

        let inner = Arc::clone(&self.inner);
        let result = tokio::task::spawn_blocking(move || {
            let guard = inner.conn.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard
                .as_ref()
                .ok_or_else(|| Error::persister("Relational store is closed"))?;
            f(conn)
        })
        .await
        .map_err(|e| Error::persister(format!("Relational task failed: {}", e)))?;

        drop(gate);
        result
    }

    /// Release the connection
    ///
    /// Waits for in-flight operations to leave the gate. Repeated calls are no-ops.
    pub async fn close(&self) -> Result<(), Error> {
        let mut gate = self.inner.gate.write().await;
        if *gate == MigrationState::Closed {
            return Ok(());
        }
        *gate = MigrationState::Closed;
        self.inner.closed.store(true, Ordering::SeqCst);

        let conn = self
            .inner
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| Error::from(e))?;
        }

        tracing::debug!("Relational store closed");
        Ok(())
    }
}

fn apply_schema(conn: &mut Connection, tables: &[&str]) -> Result<u32, Error> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    for table in tables {
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key        TEXT PRIMARY KEY NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );"
        ))?;
    }

    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, chrono::Utc::now().to_rfc3339()],
    )?;

    let version: u32 =
        tx.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })?;

    tx.commit()?;
    Ok(version)
}

/// A domain table on a shared [`SqliteHandle`]
#[derive(Debug, Clone)]
pub struct SqliteTable {
    handle: SqliteHandle,
    domain: Domain,
    closed: Arc<AtomicBool>,
}

impl SqliteTable {
    /// Create a table persister; the handle must be migrated for `domain`
    pub fn new(handle: SqliteHandle, domain: Domain) -> Self {
        Self {
            handle,
            domain,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::persister(format!("{} persister is closed", self.domain)));
        }
        Ok(())
    }
}

#[async_trait]
impl Persister for SqliteTable {
    fn domain(&self) -> Domain {
        self.domain
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.handle.is_open()
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, Error> {
        self.ensure_open()?;
        let table = self.domain.as_str();
        let key = key.to_string();

        let raw: Option<String> = self
            .handle
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("SELECT value FROM {table} WHERE key = ?1"),
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(Error::from)
            })
            .await?;

        raw.map(|s| serde_json::from_str(&s).map_err(Error::from))
            .transpose()
    }

    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<(), Error> {
        self.ensure_open()?;
        let table = self.domain.as_str();
        let key = key.to_string();
        let value = serde_json::to_string(value)?;

        self.handle
            .with_conn(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (key, value, updated_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"
                    ),
                    params![key, value, chrono::Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.ensure_open()?;
        let table = self.domain.as_str();
        let key = key.to_string();

        self.handle
            .with_conn(move |conn| {
                conn.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])?;
                Ok(())
            })
            .await
    }

    async fn list_keys(&self) -> Result<Vec<String>, Error> {
        self.ensure_open()?;
        let table = self.domain.as_str();

        self.handle
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT key FROM {table} ORDER BY key"))?;
                let keys = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(keys)
            })
            .await
    }

    async fn close(&self) -> Result<(), Error> {
        // Statements are not cached; the shared handle is closed by its owner
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
