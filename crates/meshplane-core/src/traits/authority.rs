// # Remote Authority Trait
//
// Defines the interface a remote provider uses to talk to its external
// identity and preference authority.
//
// ## Implementations
//
// - HTTP: `meshplane-remote` crate
//
// ## Usage
//
// ```rust,ignore
// use meshplane_core::traits::RemoteAuthority;
//
// let authority = /* RemoteAuthority implementation */;
// let token = authority.exchange_token("login-code").await?;
// let prefs = authority.fetch_preferences(&token).await?;
// ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Preference documents keyed by user identifier
pub type PreferenceSet = BTreeMap<String, serde_json::Value>;

/// Trait for remote authority clients
///
/// # Trust Level: Untrusted
///
/// Authorities are external integrations with strict limitations:
///
/// ## Allowed Capabilities
/// - ✅ Perform HTTP/HTTPS calls to their own base URL
/// - ✅ Parse authority-specific responses
/// - ✅ Return success or failure (the provider's sync loop handles retry)
///
/// ## Forbidden Capabilities
/// - ❌ Spawn tasks (sync scheduling is owned by `RemoteProvider`)
/// - ❌ Retry or back off (the next sync tick is the retry)
/// - ❌ Access persisters (the cache is owned by `RemoteProvider`)
/// - ❌ Log tokens
///
/// Every call is wrapped in a deadline by the caller; implementations should
/// also configure their own transport timeout.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Pull the latest preference set visible to `token`
    async fn fetch_preferences(&self, token: &str) -> Result<PreferenceSet, crate::Error>;

    /// Push one user's preferences to the authority
    async fn push_preferences(
        &self,
        token: &str,
        user: &str,
        preferences: &serde_json::Value,
    ) -> Result<(), crate::Error>;

    /// Exchange a login code for an opaque session token
    async fn exchange_token(&self, code: &str) -> Result<String, crate::Error>;

    /// Authority name (for logging/debugging)
    fn authority_name(&self) -> &str;
}

/// Helper trait for constructing authorities for a parsed provider URL
pub trait AuthorityFactory: Send + Sync {
    /// Create an authority client for `base_url`
    ///
    /// # Parameters
    ///
    /// - `base_url`: The validated provider base URL
    /// - `timeout`: Transport timeout for each request
    fn create(
        &self,
        base_url: &Url,
        timeout: Duration,
    ) -> Result<Arc<dyn RemoteAuthority>, crate::Error>;
}
