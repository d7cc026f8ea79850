//! Shared request-handling configuration
//!
//! Built once at startup and handed to the surrounding server behind an
//! `Arc`. Everything in here is read-mostly.

use std::sync::Arc;
use std::time::Duration;

use crate::channels::ChannelBridge;
use crate::error::Result;
use crate::persister::PersisterSet;
use crate::queue::TaskQueue;
use crate::registry::ProviderRegistry;
use crate::traits::broker::{BrokerConnection, BrokerMessage};
use crate::traits::job_handler::Job;
use crate::traits::provider::Provider;

/// Aggregate of the handles request handlers need
pub struct HandlerConfig {
    /// Provider registry
    pub providers: Arc<ProviderRegistry>,
    /// Cookie that pins a browser session to a provider
    pub provider_cookie_name: String,
    /// Lifetime of that cookie
    pub provider_cookie_duration: Duration,
    /// Token attached to anonymously published results
    pub anonymous_results_token: Option<String>,
    /// The three named channels
    pub channels: Arc<ChannelBridge>,
    /// Background job queue
    pub queue: Arc<TaskQueue>,
    /// Shared persistence handle
    pub persisters: Arc<PersisterSet>,
    /// Broker connection
    pub broker: Arc<dyn BrokerConnection>,
}

impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("providers", &self.providers)
            .field("provider_cookie_name", &self.provider_cookie_name)
            .field("provider_cookie_duration", &self.provider_cookie_duration)
            .field(
                "anonymous_results_token",
                &self.anonymous_results_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("queue", &self.queue.name())
            .field("broker", &self.broker.broker_name())
            .finish()
    }
}

impl HandlerConfig {
    /// Provider selected by the provider cookie value
    ///
    /// No cookie selects the local provider.
    pub fn provider_for_cookie(&self, cookie: Option<&str>) -> Result<Arc<dyn Provider>> {
        match cookie {
            Some(name) if !name.is_empty() => self.providers.lookup(name),
            _ => self.providers.local(),
        }
    }

    /// Queue a metrics submission without waiting
    pub fn submit_metrics(&self, payload: serde_json::Value) -> Result<()> {
        self.queue.enqueue(Job::submit_metrics(payload))
    }

    /// Hand a message to the outbound publisher
    pub async fn publish(&self, message: BrokerMessage) -> Result<()> {
        self.channels.broker_outbound.sender().send(message).await
    }
}
