//! Provider implementations
//!
//! - [`LocalProvider`]: always present, named [`LOCAL_PROVIDER_NAME`]
//! - [`RemoteProvider`]: one per configured base URL, named by its host
//!   (with the port when the URL names one)
//!
//! Both compose a [`ProviderBase`] holding the identity and the shared
//! persistence handle.

pub mod local;
pub mod remote;

pub use local::LocalProvider;
pub use remote::{RemoteProvider, SyncState, SyncStats, SyncStatsSnapshot};

use std::sync::{Arc, OnceLock};

use url::Url;

use crate::persister::PersisterSet;

/// Registry name of the local provider
pub const LOCAL_PROVIDER_NAME: &str = "Local";

/// Registry key for a remote authority: `host`, or `host:port` when the URL
/// carries a non-default port. `None` when the URL has no host.
pub fn authority_host(url: &Url) -> Option<String> {
    let host = url.host_str().filter(|h| !h.is_empty())?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Identity and persistence shared by every provider variant
#[derive(Debug)]
pub struct ProviderBase {
    /// Set once the provider knows its registry key
    name: OnceLock<String>,
    base_url: String,
    persisters: Arc<PersisterSet>,
}

impl ProviderBase {
    /// Base with a known name
    pub fn named(
        name: impl Into<String>,
        base_url: impl Into<String>,
        persisters: Arc<PersisterSet>,
    ) -> Self {
        let base = Self::unnamed(base_url, persisters);
        let _ = base.name.set(name.into());
        base
    }

    /// Base whose name is derived later (from the parsed URL)
    pub fn unnamed(base_url: impl Into<String>, persisters: Arc<PersisterSet>) -> Self {
        Self {
            name: OnceLock::new(),
            base_url: base_url.into(),
            persisters,
        }
    }

    /// Registry name; falls back to the raw base URL until one is assigned
    pub fn name(&self) -> &str {
        self.name.get().map(String::as_str).unwrap_or(&self.base_url)
    }

    /// Assign the name; the first assignment wins
    pub fn set_name(&self, name: impl Into<String>) {
        let _ = self.name.set(name.into());
    }

    /// Raw base URL as configured
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The shared persistence handle
    pub fn persisters(&self) -> &Arc<PersisterSet> {
        &self.persisters
    }
}
