//! The local provider
//!
//! No remote authentication and no background tasks: preferences are read
//! and written straight through the `Preferences` domain.

use async_trait::async_trait;
use std::sync::Arc;

use crate::Error;
use crate::persister::PersisterSet;
use crate::provider::{LOCAL_PROVIDER_NAME, ProviderBase};
use crate::traits::persister::Domain;
use crate::traits::provider::{Capabilities, Provider, ProviderKind};

/// Domains the local provider needs at startup
pub const LOCAL_DOMAINS: [Domain; 11] = [
    Domain::Preferences,
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

/// Self-contained provider backed directly by the persister set
#[derive(Debug)]
pub struct LocalProvider {
    base: ProviderBase,
}

impl LocalProvider {
    /// Create the local provider
    pub fn new(base_url: impl Into<String>, persisters: Arc<PersisterSet>) -> Self {
        Self {
            base: ProviderBase::named(LOCAL_PROVIDER_NAME, base_url, persisters),
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn base_url(&self) -> &str {
        self.base.base_url()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            session_management: false,
            preference_sync: false,
            persistence: true,
        }
    }

    async fn initialize(&self) -> Result<(), Error> {
        self.base.persisters().ensure_open(&LOCAL_DOMAINS)?;
        tracing::info!("Local provider ready at {}", self.base.base_url());
        Ok(())
    }

    fn generic_persister(&self) -> Arc<PersisterSet> {
        Arc::clone(self.base.persisters())
    }

    async fn read_preferences(&self, user: &str) -> Result<Option<serde_json::Value>, Error> {
        self.base
            .persisters()
            .persister(Domain::Preferences)?
            .get(user)
            .await
    }

    async fn write_preferences(
        &self,
        user: &str,
        preferences: &serde_json::Value,
    ) -> Result<(), Error> {
        self.base
            .persisters()
            .persister(Domain::Preferences)?
            .put(user, preferences)
            .await
    }
}
