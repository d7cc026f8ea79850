// # Persister Set
//
// The single persistence handle shared by every provider.
//
// ## Opening
//
// `PersisterSet::open` creates each domain's backing store from the data
// directory:
//
// - Memory domains: fresh in-process maps
// - File domains: `<data_dir>/<domain>.json`
// - Relational domains: tables in `<data_dir>/meshplane.db`, after the schema
//   migration has completed
//
// Any failure while opening is fatal to startup.
//
// ## Closing
//
// `close()` releases everything exactly once: relational tables, then the
// relational handle, then the file and memory stores. A failure on one
// store is logged and the rest are still closed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::Error;
use crate::config::ServerConfig;
use crate::persister::file::FileKvStore;
use crate::persister::memory::MemoryKvStore;
use crate::persister::sqlite::{SqliteHandle, SqliteTable};
use crate::traits::persister::{Backend, Domain, Persister};

/// File name of the relational database inside the data directory
pub const DATABASE_FILE: &str = "meshplane.db";

/// Composite of all domain persisters
pub struct PersisterSet {
    /// Persisters in open order
    entries: Vec<(Domain, Arc<dyn Persister>)>,
    index: HashMap<Domain, usize>,
    relational: Option<SqliteHandle>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PersisterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersisterSet")
            .field("domains", &self.domains())
            .field("relational", &self.relational.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PersisterSet {
    /// Open every domain under `config.data_dir`
    ///
    /// # Errors
    ///
    /// Always [`Error::FatalInit`]: a store that cannot be opened or a
    /// migration that fails must prevent startup.
    pub async fn open(config: &ServerConfig) -> Result<Self, Error> {
        Self::open_in(&config.data_dir)
            .await
            .map_err(Error::into_fatal)
    }

    async fn open_in(data_dir: &Path) -> Result<Self, Error> {
        tokio::fs::create_dir_all(data_dir).await.map_err(|e| {
            Error::persister(format!(
                "Failed to create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        let relational_domains: Vec<Domain> = Domain::ALL
            .into_iter()
            .filter(|d| d.backend() == Backend::Relational)
            .collect();

        let handle = SqliteHandle::open(data_dir.join(DATABASE_FILE))?;
        handle.migrate(&relational_domains).await?;

        let mut builder = Self::builder().with_relational(handle.clone());
        for domain in Domain::ALL {
            let persister: Arc<dyn Persister> = match domain.backend() {
                Backend::Memory => Arc::new(MemoryKvStore::new(domain)),
                Backend::File => {
                    let path = data_dir.join(format!("{}.json", domain.as_str()));
                    Arc::new(FileKvStore::open(path, domain).await?)
                }
                Backend::Relational => Arc::new(SqliteTable::new(handle.clone(), domain)),
            };
            builder = builder.with(persister);
        }

        let set = builder.build();
        tracing::info!(
            "Opened {} persisters under {}",
            set.entries.len(),
            data_dir.display()
        );
        Ok(set)
    }

    /// Every domain backed by an in-memory map, no relational handle
    pub fn in_memory() -> Self {
        Domain::ALL
            .into_iter()
            .fold(Self::builder(), |builder, domain| {
                builder.with(Arc::new(MemoryKvStore::new(domain)))
            })
            .build()
    }

    /// Start assembling a set from individual persisters
    pub fn builder() -> PersisterSetBuilder {
        PersisterSetBuilder::default()
    }

    /// The persister for `domain`
    pub fn persister(&self, domain: Domain) -> Result<Arc<dyn Persister>, Error> {
        self.index
            .get(&domain)
            .map(|&i| Arc::clone(&self.entries[i].1))
            .ok_or_else(|| Error::not_found(format!("No persister for domain {}", domain)))
    }

    /// Domains present in the set, in open order
    pub fn domains(&self) -> Vec<Domain> {
        self.entries.iter().map(|(d, _)| *d).collect()
    }

    /// The shared relational handle, if any
    pub fn relational(&self) -> Option<&SqliteHandle> {
        self.relational.as_ref()
    }

    /// Check that `domains` are present and open
    ///
    /// Used by providers during initialization; a miss is fatal.
    pub fn ensure_open(&self, domains: &[Domain]) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::fatal_init("Persister set is closed"));
        }

        for &domain in domains {
            let persister = self
                .persister(domain)
                .map_err(Error::into_fatal)?;
            if !persister.is_open() {
                return Err(Error::fatal_init(format!("{} persister is closed", domain)));
            }
        }
        Ok(())
    }

    /// Whether `close()` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every persister exactly once
    ///
    /// Returns the first error encountered; later calls are no-ops.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Persister set already closed");
            return Ok(());
        }

        let mut first_error: Option<Error> = None;
        let mut record = |domain: Option<Domain>, result: Result<(), Error>| {
            if let Err(e) = result {
                match domain {
                    Some(d) => tracing::error!("Failed to close {} persister: {}", d, e),
                    None => tracing::error!("Failed to close relational store: {}", e),
                }
                first_error.get_or_insert(e);
            }
        };

        // Relational tables, newest first
        for (domain, persister) in self.entries.iter().rev() {
            if domain.backend() == Backend::Relational {
                record(Some(*domain), persister.close().await);
            }
        }

        if let Some(handle) = &self.relational {
            record(None, handle.close().await);
        }

        for (domain, persister) in self.entries.iter().rev() {
            if domain.backend() != Backend::Relational {
                record(Some(*domain), persister.close().await);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("All persisters closed");
                Ok(())
            }
        }
    }
}

/// Builder for [`PersisterSet`]
#[derive(Default)]
pub struct PersisterSetBuilder {
    entries: Vec<(Domain, Arc<dyn Persister>)>,
    relational: Option<SqliteHandle>,
}

impl PersisterSetBuilder {
    /// Add a persister; a later persister for the same domain replaces the earlier one
    pub fn with(mut self, persister: Arc<dyn Persister>) -> Self {
        let domain = persister.domain();
        self.entries.retain(|(d, _)| *d != domain);
        self.entries.push((domain, persister));
        self
    }

    /// Attach the relational handle that backs the table persisters
    pub fn with_relational(mut self, handle: SqliteHandle) -> Self {
        self.relational = Some(handle);
        self
    }

    /// Finish the set
    pub fn build(self) -> PersisterSet {
        let index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (d, _))| (*d, i))
            .collect();

        PersisterSet {
            entries: self.entries,
            index,
            relational: self.relational,
            closed: AtomicBool::new(false),
        }
    }
}
