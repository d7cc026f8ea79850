// # Provider Trait
//
// Defines the shared contract of the local and remote providers.
//
// ## Variants
//
// - `LocalProvider`: self-contained, delegates straight to the persister set
// - `RemoteProvider`: delegates identity to an external authority, keeps a
//   token store and a background preference-sync loop
//
// Remote-only capabilities are reached through [`Provider::as_remote`]
// rather than by widening this trait.

use async_trait::async_trait;
use std::sync::Arc;

use crate::persister::PersisterSet;
use crate::provider::RemoteProvider;

/// Provider variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Local,
    Remote,
}

/// What a provider can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Issues and validates session tokens
    pub session_management: bool,
    /// Keeps preferences in sync with an external authority
    pub preference_sync: bool,
    /// Delegates storage to the shared persister set
    pub persistence: bool,
}

/// Trait implemented by every provider in the registry
///
/// # Thread Safety
///
/// Providers are shared as `Arc<dyn Provider>` across request handlers and
/// background tasks. All methods must be safe to call concurrently.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry key (`Local`, or the host of a remote base URL)
    fn name(&self) -> &str;

    /// Provider variant
    fn kind(&self) -> ProviderKind;

    /// Base URL of the provider
    fn base_url(&self) -> &str;

    /// Capability set
    fn capabilities(&self) -> Capabilities;

    /// Prepare the provider for use
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Ready to be registered
    /// - `Err(Error::FatalInit)`: Local storage unusable, the process must not start
    /// - `Err(Error::InvalidProviderUrl)`: Remote provider unusable, skip it
    async fn initialize(&self) -> Result<(), crate::Error>;

    /// The shared persistence handle
    fn generic_persister(&self) -> Arc<PersisterSet>;

    /// Read a user's preferences
    async fn read_preferences(&self, user: &str) -> Result<Option<serde_json::Value>, crate::Error>;

    /// Store a user's preferences
    async fn write_preferences(
        &self,
        user: &str,
        preferences: &serde_json::Value,
    ) -> Result<(), crate::Error>;

    /// Token of an authenticated session, if the provider manages sessions
    fn session_token(&self, _session_id: &str) -> Option<String> {
        None
    }

    /// Downcast to the remote variant
    fn as_remote(&self) -> Option<&RemoteProvider> {
        None
    }
}
