//! Provider registry
//!
//! Maps provider names to live providers. Populated once at startup, then
//! read concurrently by request handling.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meshplane_core::registry::ProviderRegistry;
//!
//! let registry = ProviderRegistry::new();
//! registry.register(local_provider)?;
//! registry.register(remote_provider)?;
//!
//! let provider = registry.lookup("cloud.example")?;
//! let prefs = provider.read_preferences("user-1").await?;
//! ```
//!
//! Session tokens live in each remote provider's own store; the registry map
//! is never written after startup.

use crate::error::{Error, Result};
use crate::provider::LOCAL_PROVIDER_NAME;
use crate::traits::Provider;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Name → provider map
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name
    ///
    /// # Errors
    ///
    /// - `Error::Config`: a provider with the same name is already registered
    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let name = provider.name().to_string();
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);

        if providers.contains_key(&name) {
            return Err(Error::config(format!(
                "Provider '{}' is already registered",
                name
            )));
        }

        tracing::debug!(provider = %name, kind = ?provider.kind(), "Provider registered");
        providers.insert(name, provider);
        Ok(())
    }

    /// Look up a provider by name
    ///
    /// # Returns
    ///
    /// - `Ok(provider)`: The registered provider
    /// - `Err(Error::NotFound)`: No provider with this name
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("Provider '{}'", name)))
    }

    /// The always-present local provider
    pub fn local(&self) -> Result<Arc<dyn Provider>> {
        self.lookup(LOCAL_PROVIDER_NAME)
    }

    /// Every registered provider, sorted by name
    pub fn all(&self) -> Vec<Arc<dyn Provider>> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = providers.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
