//! Control plane lifecycle
//!
//! The ControlPlane is responsible for:
//! - Opening the persister set and running the schema migration
//! - Populating the provider registry (Local plus every valid remote URL)
//! - Starting each remote provider's preference sync loop
//! - Creating the channel bridge, task queue and broker bridge tasks
//! - Tearing all of it down in a fixed order
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ ControlPlane │
//!                      └──────────────┘
//!                             │
//!     ┌──────────────┬────────┴───────┬───────────────┐
//!     ▼              ▼                ▼               ▼
//! ┌──────────┐ ┌───────────┐ ┌───────────────┐ ┌───────────┐
//! │ Provider │ │  Channel  │ │ Broker bridge │ │ TaskQueue │
//! │ Registry │ │  Bridge   │ │ (4 tasks)     │ │           │
//! └──────────┘ └───────────┘ └───────────────┘ └───────────┘
//!      │                             │
//!      └──────────────┬──────────────┘
//!                     ▼
//!              ┌──────────────┐
//!              │ PersisterSet │
//!              └──────────────┘
//! ```
//!
//! ## Shutdown Order
//!
//! 1. Stop every remote sync loop
//! 2. Stop channels (cluster-sync, broker-inbound after draining, broker-outbound)
//!    and join the bridge tasks
//! 3. Stop the task queue
//! 4. Close persisters (relational tables, relational handle, KV stores)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::broker::{BridgeHandle, BrokerBridge, IngestEvent, IngestStatsSnapshot};
use crate::channels::ChannelBridge;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::handler_config::HandlerConfig;
use crate::persister::PersisterSet;
use crate::provider::{LocalProvider, RemoteProvider};
use crate::queue::TaskQueue;
use crate::registry::ProviderRegistry;
use crate::traits::{
    AuthorityFactory, BrokerConnection, JobHandler, Provider, SUBMIT_METRICS_JOB,
};

/// External collaborators supplied by the embedding server
#[derive(Clone)]
pub struct Collaborators {
    /// Broker connection feeding the channel bridge
    pub broker: Arc<dyn BrokerConnection>,
    /// Builds authority clients for remote providers
    pub authority_factory: Arc<dyn AuthorityFactory>,
    /// Handler for `submitMetrics` jobs
    pub metrics_handler: Arc<dyn JobHandler>,
}

/// A running control plane
///
/// ## Lifecycle
///
/// 1. Create with [`ControlPlane::start()`]
/// 2. Hand [`ControlPlane::handler_config()`] to request handling
/// 3. Run with [`ControlPlane::run()`] until a shutdown signal, or call
///    [`ControlPlane::shutdown()`] directly
pub struct ControlPlane {
    handler_config: Arc<HandlerConfig>,
    remotes: Vec<Arc<RemoteProvider>>,
    skipped: Vec<String>,
    bridge: tokio::sync::Mutex<Option<BridgeHandle>>,
    bridge_stats: tokio::sync::Mutex<IngestStatsSnapshot>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("handler_config", &self.handler_config)
            .field("remotes", &self.remotes.len())
            .field("skipped", &self.skipped)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl ControlPlane {
    /// Open storage under `config.data_dir` and start everything
    ///
    /// # Returns
    ///
    /// A tuple of (control_plane, event_receiver) where event_receiver yields
    /// one [`IngestEvent`] per inbound broker message
    ///
    /// # Errors
    ///
    /// - `Error::Config`: invalid configuration
    /// - `Error::FatalInit`: storage could not be opened or migrated
    pub async fn start(
        config: ServerConfig,
        collaborators: Collaborators,
    ) -> Result<(Self, mpsc::Receiver<IngestEvent>)> {
        config.validate()?;
        let persisters = Arc::new(PersisterSet::open(&config).await?);
        Self::start_with_persisters(config, persisters, collaborators).await
    }

    /// Start on an already opened persister set
    ///
    /// On failure the persister set is closed before the error is returned.
    pub async fn start_with_persisters(
        config: ServerConfig,
        persisters: Arc<PersisterSet>,
        collaborators: Collaborators,
    ) -> Result<(Self, mpsc::Receiver<IngestEvent>)> {
        config.validate()?;

        match Self::assemble(&config, Arc::clone(&persisters), collaborators).await {
            Ok(started) => Ok(started),
            Err(e) => {
                if let Err(close_err) = persisters.close().await {
                    error!("Failed to close persisters after startup error: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn assemble(
        config: &ServerConfig,
        persisters: Arc<PersisterSet>,
        collaborators: Collaborators,
    ) -> Result<(Self, mpsc::Receiver<IngestEvent>)> {
        let registry = Arc::new(ProviderRegistry::new());

        let local = Arc::new(LocalProvider::new(
            config.local_provider_url.clone(),
            Arc::clone(&persisters),
        ));
        local.initialize().await?;
        registry.register(local)?;

        let mut remotes = Vec::new();
        let mut skipped = Vec::new();
        for url in &config.provider_base_urls {
            let remote = Arc::new(RemoteProvider::new(
                url.clone(),
                Arc::clone(&persisters),
                Arc::clone(&collaborators.authority_factory),
                config.session.clone(),
                config.sync.clone(),
            ));

            match remote.initialize().await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(url = %url, "Skipping remote provider: {}", e);
                    skipped.push(url.clone());
                    continue;
                }
            }

            if let Err(e) = registry.register(remote.clone()) {
                warn!(url = %url, "Skipping remote provider: {}", e);
                skipped.push(url.clone());
                continue;
            }

            remotes.push(remote);
        }

        for remote in &remotes {
            if let Err(e) = remote.sync_preferences().await {
                warn!(provider = %remote.name(), "Preference sync not started: {}", e);
            }
        }

        let channels = Arc::new(ChannelBridge::new(config.broker.channel_capacity));

        let queue = Arc::new(TaskQueue::new(&config.queue));
        queue.register_handler(SUBMIT_METRICS_JOB, collaborators.metrics_handler)?;

        let (bridge, events) = BrokerBridge::start(
            Arc::clone(&collaborators.broker),
            &channels,
            Arc::clone(&persisters),
            &config.broker,
        )?;

        let handler_config = Arc::new(HandlerConfig {
            providers: registry,
            provider_cookie_name: config.session.provider_cookie_name.clone(),
            provider_cookie_duration: config.session.provider_cookie_duration(),
            anonymous_results_token: config.anonymous_results_token.clone(),
            channels,
            queue,
            persisters,
            broker: collaborators.broker,
        });

        info!(
            providers = ?handler_config.providers.names(),
            skipped = skipped.len(),
            "Control plane started"
        );

        Ok((
            Self {
                handler_config,
                remotes,
                skipped,
                bridge: tokio::sync::Mutex::new(Some(bridge)),
                bridge_stats: tokio::sync::Mutex::new(IngestStatsSnapshot::default()),
                shut_down: AtomicBool::new(false),
            },
            events,
        ))
    }

    /// Shared handles for request handling
    pub fn handler_config(&self) -> Arc<HandlerConfig> {
        Arc::clone(&self.handler_config)
    }

    /// Provider registry
    pub fn providers(&self) -> Arc<ProviderRegistry> {
        Arc::clone(&self.handler_config.providers)
    }

    /// Remote providers that were registered
    pub fn remotes(&self) -> &[Arc<RemoteProvider>] {
        &self.remotes
    }

    /// Configured URLs that did not produce a provider
    pub fn skipped_urls(&self) -> &[String] {
        &self.skipped
    }

    /// Ingestion counters (final values once shut down)
    pub async fn ingest_stats(&self) -> IngestStatsSnapshot {
        match self.bridge.lock().await.as_ref() {
            Some(bridge) => bridge.stats(),
            None => *self.bridge_stats.lock().await,
        }
    }

    /// Whether `shutdown()` has run
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Tear everything down in order
    ///
    /// Idempotent. Returns the persister close error, if any.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Control plane shutting down");

        for remote in &self.remotes {
            remote.stop_sync_preferences().await;
        }
        info!("Preference sync loops stopped");

        self.handler_config.channels.stop_all().await;
        if let Some(bridge) = self.bridge.lock().await.take() {
            *self.bridge_stats.lock().await = bridge.stats();
            bridge.join().await;
        }
        info!("Channels stopped");

        self.handler_config.queue.shutdown().await;

        self.handler_config.persisters.close().await?;
        info!("Control plane stopped");
        Ok(())
    }

    /// Run until Ctrl-C, then shut down
    pub async fn run(&self) -> Result<()> {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
        self.shutdown().await
    }

    /// Run until `shutdown_rx` fires (or its sender is dropped), then shut down
    ///
    /// **TESTING ONLY**: production code should use `run()`, which reacts to
    /// OS signals.
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let _ = shutdown_rx.await;
        info!("Shutdown signal received");
        self.shutdown().await
    }
}
