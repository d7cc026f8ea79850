//! Persister implementations
//!
//! - [`MemoryKvStore`]: in-process map
//! - [`FileKvStore`]: JSON file with crash recovery
//! - [`SqliteTable`]: table on a shared [`SqliteHandle`]
//! - [`PersisterSet`]: the composite handle providers share

pub mod file;
pub mod memory;
pub mod set;
pub mod sqlite;

pub use file::FileKvStore;
pub use memory::MemoryKvStore;
pub use set::{DATABASE_FILE, PersisterSet, PersisterSetBuilder};
pub use sqlite::{MigrationState, SCHEMA_VERSION, SqliteHandle, SqliteTable};
