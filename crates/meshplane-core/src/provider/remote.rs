// # Remote Provider
//
// A provider that delegates identity to an external authority.
//
// ## Lifecycle
//
// ```text
// Uninitialized ──initialize()──▶ Initialized ──sync_preferences()──▶ Syncing ⇄ Idle
//                                                                         │
//                                              stop_sync_preferences() ───┴──▶ Stopped
// ```
//
// ## Preference Sync
//
// One background task per provider. Every tick (the first one fires
// immediately) it pulls the authority's preference set for each session that
// holds a live token and writes each entry into the remote preference cache,
// skipping entries whose serialized form is unchanged. A failed pull is
// logged and counted; the next tick is the retry.
//
// ## Token Store
//
// Session id → opaque token, each entry stamped on insert. Entries older than
// the login cookie duration are evicted on read. A user's session id is their
// user identifier, so preference pushes use the token stored under the user.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;

use crate::Error;
use crate::config::{SessionConfig, SyncConfig};
use crate::persister::PersisterSet;
use crate::provider::{ProviderBase, authority_host};
use crate::traits::authority::{AuthorityFactory, RemoteAuthority};
use crate::traits::persister::{Domain, Persister};
use crate::traits::provider::{Capabilities, Provider, ProviderKind};

/// Position of a remote provider in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Constructed, URL not yet parsed
    Uninitialized,
    /// URL parsed and authority client built; no sync loop yet
    Initialized,
    /// A pull is in progress
    Syncing,
    /// Waiting for the next tick
    Idle,
    /// Sync loop stopped for good
    Stopped,
}

/// Counters maintained by the sync loop
#[derive(Debug, Default)]
pub struct SyncStats {
    ticks: AtomicU64,
    pulls: AtomicU64,
    writes: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStatsSnapshot {
    /// Completed ticks
    pub ticks: u64,
    /// Successful preference pulls
    pub pulls: u64,
    /// Cache entries written (changed values only)
    pub writes: u64,
    /// Failed pulls
    pub failures: u64,
}

impl SyncStats {
    /// Read all counters
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            ticks: self.ticks.load(Ordering::SeqCst),
            pulls: self.pulls.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }
}

/// Identity derived from the parsed base URL
#[derive(Debug, Clone)]
struct RemoteIdentity {
    url: Url,
    ref_cookie_name: String,
    session_name: String,
}

struct TokenEntry {
    token: String,
    issued_at: Instant,
}

/// Session id → token map with expiry
struct TokenStore {
    entries: RwLock<HashMap<String, TokenEntry>>,
    ttl: Duration,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("TokenStore")
            .field("sessions", &sessions)
            .field("tokens", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenStore {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn insert(&self, session_id: &str, token: String) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                session_id.to_string(),
                TokenEntry {
                    token,
                    issued_at: Instant::now(),
                },
            );
    }

    fn get(&self, session_id: &str) -> Option<String> {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(session_id) {
                None => return None,
                Some(entry) if entry.issued_at.elapsed() < self.ttl => {
                    return Some(entry.token.clone());
                }
                Some(_) => {}
            }
        }

        // Expired: evict under the write lock, unless it was refreshed meanwhile
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get(session_id) {
            Some(entry) if entry.issued_at.elapsed() < self.ttl => Some(entry.token.clone()),
            Some(_) => {
                entries.remove(session_id);
                tracing::debug!(session = session_id, "Evicted expired session token");
                None
            }
            None => None,
        }
    }

    fn remove(&self, session_id: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some()
    }

    /// Live (session id, token) pairs; expired entries are evicted
    fn live(&self) -> Vec<(String, String)> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.issued_at.elapsed() < ttl);
        entries
            .iter()
            .map(|(session, entry)| (session.clone(), entry.token.clone()))
            .collect()
    }
}

struct SyncTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Everything one pull needs, cloned out of the provider
struct SyncWorker {
    provider: String,
    authority: Arc<dyn RemoteAuthority>,
    tokens: Arc<TokenStore>,
    cache: Arc<dyn Persister>,
    timeout: Duration,
    state: Arc<Mutex<SyncState>>,
    stats: Arc<SyncStats>,
}

impl SyncWorker {
    async fn run(self, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    self.pull_once().await;
                }
            }
        }

        tracing::debug!(provider = %self.provider, "Preference sync loop exited");
    }

    async fn pull_once(&self) {
        set_state(&self.state, SyncState::Syncing);

        for (session, token) in self.tokens.live() {
            match self.pull_session(&token).await {
                Ok(written) => {
                    self.stats.pulls.fetch_add(1, Ordering::SeqCst);
                    if written > 0 {
                        tracing::debug!(
                            provider = %self.provider,
                            session = %session,
                            written,
                            "Preference cache updated"
                        );
                    }
                }
                Err(e) => {
                    self.stats.failures.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        provider = %self.provider,
                        session = %session,
                        "Preference sync failed, retrying next tick: {}",
                        e
                    );
                }
            }
        }

        self.stats.ticks.fetch_add(1, Ordering::SeqCst);

        // A concurrent stop wins over the return to Idle
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SyncState::Syncing {
            *state = SyncState::Idle;
        }
    }

    /// Pull and cache one session's preferences, returning the number of writes
    async fn pull_session(&self, token: &str) -> Result<u64, Error> {
        let fetched = tokio::time::timeout(self.timeout, self.authority.fetch_preferences(token))
            .await
            .map_err(|_| {
                Error::transient_sync(
                    &self.provider,
                    format!("authority did not answer within {:?}", self.timeout),
                )
            })?
            .map_err(|e| match e {
                Error::TransientSync { .. } => e,
                other => Error::transient_sync(&self.provider, other.to_string()),
            })?;

        let mut written = 0;
        for (user, value) in fetched {
            let key = cache_key(&self.provider, &user);
            if let Some(cached) = self.cache.get(&key).await?
                && serde_json::to_vec(&cached)? == serde_json::to_vec(&value)?
            {
                continue;
            }
            self.cache.put(&key, &value).await?;
            self.stats.writes.fetch_add(1, Ordering::SeqCst);
            written += 1;
        }
        Ok(written)
    }
}

fn set_state(state: &Mutex<SyncState>, next: SyncState) {
    let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
    if *guard != SyncState::Stopped {
        *guard = next;
    }
}

/// Cache key for one user's preferences from `provider`
fn cache_key(provider: &str, user: &str) -> String {
    format!("{}/{}", provider, user)
}

/// Provider backed by an external authority
pub struct RemoteProvider {
    base: ProviderBase,
    identity: OnceLock<RemoteIdentity>,
    authority_factory: Arc<dyn AuthorityFactory>,
    authority: OnceLock<Arc<dyn RemoteAuthority>>,
    tokens: Arc<TokenStore>,
    session: SessionConfig,
    sync: SyncConfig,
    state: Arc<Mutex<SyncState>>,
    stats: Arc<SyncStats>,
    sync_task: tokio::sync::Mutex<Option<SyncTask>>,
}

impl std::fmt::Debug for RemoteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProvider")
            .field("name", &self.base.name())
            .field("base_url", &self.base.base_url())
            .field("state", &self.state())
            .field("tokens", &self.tokens)
            .finish()
    }
}

impl RemoteProvider {
    /// Create an uninitialized remote provider for `base_url`
    pub fn new(
        base_url: impl Into<String>,
        persisters: Arc<PersisterSet>,
        authority_factory: Arc<dyn AuthorityFactory>,
        session: SessionConfig,
        sync: SyncConfig,
    ) -> Self {
        let tokens = Arc::new(TokenStore::new(session.login_cookie_duration()));
        Self {
            base: ProviderBase::unnamed(base_url, persisters),
            identity: OnceLock::new(),
            authority_factory,
            authority: OnceLock::new(),
            tokens,
            session,
            sync,
            state: Arc::new(Mutex::new(SyncState::Uninitialized)),
            stats: Arc::new(SyncStats::default()),
            sync_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sync loop counters
    pub fn sync_stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }

    /// Parsed base URL, once initialized
    pub fn url(&self) -> Option<&Url> {
        self.identity.get().map(|i| &i.url)
    }

    /// Name of the reference cookie (`<host>_ref`)
    pub fn ref_cookie_name(&self) -> Option<&str> {
        self.identity.get().map(|i| i.ref_cookie_name.as_str())
    }

    /// Session name (`<host>`)
    pub fn session_name(&self) -> Option<&str> {
        self.identity.get().map(|i| i.session_name.as_str())
    }

    /// Lifetime of a login
    pub fn session_duration(&self) -> Duration {
        self.session.login_cookie_duration()
    }

    /// Version string reported for this provider
    pub fn provider_version(&self) -> &str {
        &self.session.remote_provider_version
    }

    fn authority(&self) -> Result<Arc<dyn RemoteAuthority>, Error> {
        self.authority.get().cloned().ok_or_else(|| {
            Error::config(format!(
                "Remote provider {} used before initialize()",
                self.base.base_url()
            ))
        })
    }

    fn cache(&self) -> Result<Arc<dyn Persister>, Error> {
        self.base.persisters().persister(Domain::RemotePreferences)
    }

    /// Exchange a login code for a token and store it under `session_id`
    pub async fn login(&self, session_id: &str, code: &str) -> Result<(), Error> {
        let authority = self.authority()?;
        let timeout = self.sync.authority_timeout();

        let token = tokio::time::timeout(timeout, authority.exchange_token(code))
            .await
            .map_err(|_| Error::auth(format!("{} did not answer within {:?}", self.name(), timeout)))??;

        self.store_token(session_id, token);
        tracing::info!(provider = %self.name(), session = session_id, "Session authenticated");
        Ok(())
    }

    /// Store a token for `session_id`, replacing any previous one
    pub fn store_token(&self, session_id: &str, token: impl Into<String>) {
        self.tokens.insert(session_id, token.into());
    }

    /// Live token for `session_id`
    pub fn token(&self, session_id: &str) -> Option<String> {
        self.tokens.get(session_id)
    }

    /// Drop the token for `session_id`; returns whether one was stored
    pub fn revoke_token(&self, session_id: &str) -> bool {
        let removed = self.tokens.remove(session_id);
        if removed {
            tracing::info!(provider = %self.name(), session = session_id, "Session token revoked");
        }
        removed
    }

    fn worker(&self) -> Result<SyncWorker, Error> {
        Ok(SyncWorker {
            provider: self.name().to_string(),
            authority: self.authority()?,
            tokens: Arc::clone(&self.tokens),
            cache: self.cache()?,
            timeout: self.sync.authority_timeout(),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
        })
    }

    /// Run one pull outside the background loop
    pub async fn sync_now(&self) -> Result<(), Error> {
        if self.state() == SyncState::Stopped {
            return Err(Error::config(format!("Preference sync for {} is stopped", self.name())));
        }
        self.worker()?.pull_once().await;
        Ok(())
    }

    /// Start the background preference sync loop
    ///
    /// Calling this while the loop runs is a no-op. A stopped provider cannot
    /// be restarted.
    pub async fn sync_preferences(&self) -> Result<(), Error> {
        let mut task = self.sync_task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        match self.state() {
            SyncState::Uninitialized => {
                return Err(Error::config(format!(
                    "Remote provider {} must be initialized before syncing",
                    self.base.base_url()
                )));
            }
            SyncState::Stopped => {
                return Err(Error::config(format!("Preference sync for {} is stopped", self.name())));
            }
            _ => {}
        }

        let worker = self.worker()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let interval = self.sync.interval();
        let handle = tokio::spawn(worker.run(interval, stop_rx));

        *task = Some(SyncTask { stop_tx, handle });
        tracing::info!(provider = %self.name(), "Preference sync started (every {:?})", interval);
        Ok(())
    }

    /// Stop the sync loop after its current tick and wait for it
    ///
    /// Idempotent. The provider ends in [`SyncState::Stopped`].
    pub async fn stop_sync_preferences(&self) {
        let task = self.sync_task.lock().await.take();

        if let Some(SyncTask { stop_tx, handle }) = task {
            let _ = stop_tx.send(true);
            if let Err(e) = handle.await {
                tracing::error!(provider = %self.name(), "Preference sync task failed: {}", e);
            }
            tracing::info!(provider = %self.name(), "Preference sync stopped");
        }

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SyncState::Stopped;
    }
}

#[async_trait]
impl Provider for RemoteProvider {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }

    fn base_url(&self) -> &str {
        self.base.base_url()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            session_management: true,
            preference_sync: true,
            persistence: true,
        }
    }

    async fn initialize(&self) -> Result<(), Error> {
        if self.identity.get().is_some() {
            return Ok(());
        }

        let raw = self.base.base_url();
        let url = Url::parse(raw).map_err(|e| Error::invalid_provider_url(raw, e.to_string()))?;
        let host = authority_host(&url)
            .ok_or_else(|| Error::invalid_provider_url(raw, "URL has no host"))?;

        // A missing cache is a storage fault, not a bad URL
        self.cache().map_err(Error::into_fatal)?;

        let authority = self
            .authority_factory
            .create(&url, self.sync.authority_timeout())?;

        let _ = self.authority.set(authority);
        let _ = self.identity.set(RemoteIdentity {
            url,
            ref_cookie_name: format!("{}_ref", host),
            session_name: host.clone(),
        });
        self.base.set_name(host);
        set_state(&self.state, SyncState::Initialized);

        tracing::info!(
            provider = %self.name(),
            version = %self.provider_version(),
            "Remote provider initialized"
        );
        Ok(())
    }

    fn generic_persister(&self) -> Arc<PersisterSet> {
        Arc::clone(self.base.persisters())
    }

    async fn read_preferences(&self, user: &str) -> Result<Option<serde_json::Value>, Error> {
        self.cache()?.get(&cache_key(self.name(), user)).await
    }

    async fn write_preferences(
        &self,
        user: &str,
        preferences: &serde_json::Value,
    ) -> Result<(), Error> {
        self.cache()?
            .put(&cache_key(self.name(), user), preferences)
            .await?;

        let Some(token) = self.tokens.get(user) else {
            return Ok(());
        };

        let authority = self.authority()?;
        let timeout = self.sync.authority_timeout();
        match tokio::time::timeout(timeout, authority.push_preferences(&token, user, preferences)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(provider = %self.name(), user, "Preference push failed: {}", e);
            }
            Err(_) => {
                tracing::warn!(provider = %self.name(), user, "Preference push timed out after {:?}", timeout);
            }
        }
        Ok(())
    }

    fn session_token(&self, session_id: &str) -> Option<String> {
        self.token(session_id)
    }

    fn as_remote(&self) -> Option<&RemoteProvider> {
        Some(self)
    }
}
