//! Configuration types for the control plane core
//!
//! Values only; how they are sourced (environment, files) is up to the
//! embedding binary.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Base URL recorded for the always-present local provider
pub const DEFAULT_LOCAL_PROVIDER_URL: &str = "https://meshplane.local";

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Remote provider base URLs; malformed entries are skipped at startup
    #[serde(default)]
    pub provider_base_urls: Vec<String>,

    /// Directory holding the embedded stores and the relational database
    pub data_dir: PathBuf,

    /// Base URL recorded for the local provider
    #[serde(default = "default_local_provider_url")]
    pub local_provider_url: String,

    /// Token attached to anonymously published results, if any
    #[serde(default)]
    pub anonymous_results_token: Option<String>,

    /// Session and cookie settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Remote preference sync settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Broker bridge settings
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Task queue settings
    #[serde(default)]
    pub queue: QueueConfig,
}

impl ServerConfig {
    /// Create a configuration with defaults rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider_base_urls: Vec::new(),
            data_dir: data_dir.into(),
            local_provider_url: default_local_provider_url(),
            anonymous_results_token: None,
            session: SessionConfig::default(),
            sync: SyncConfig::default(),
            broker: BrokerConfig::default(),
            queue: QueueConfig::default(),
        }
    }

    /// Add remote provider base URLs
    pub fn with_provider_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provider_base_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Validate the configuration
    ///
    /// Provider URLs are *not* validated here: a malformed URL only disables
    /// that provider and must never prevent startup.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::config("Data directory cannot be empty"));
        }

        self.session.validate()?;
        self.sync.validate()?;
        self.broker.validate()?;
        self.queue.validate()?;

        Ok(())
    }
}

fn default_local_provider_url() -> String {
    DEFAULT_LOCAL_PROVIDER_URL.to_string()
}

/// Session and cookie configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Name of the cookie that pins a browser session to a provider
    #[serde(default = "default_provider_cookie_name")]
    pub provider_cookie_name: String,

    /// Lifetime of the provider cookie (in seconds)
    #[serde(default = "default_provider_cookie_duration_secs")]
    pub provider_cookie_duration_secs: u64,

    /// Lifetime of a remote login; tokens older than this are treated as expired
    #[serde(default = "default_login_cookie_duration_secs")]
    pub login_cookie_duration_secs: u64,

    /// Version string reported by remote providers
    #[serde(default = "default_remote_provider_version")]
    pub remote_provider_version: String,
}

impl SessionConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.provider_cookie_name.is_empty() {
            return Err(crate::Error::config("Provider cookie name cannot be empty"));
        }
        if self.login_cookie_duration_secs == 0 {
            return Err(crate::Error::config("Login cookie duration must be > 0"));
        }
        Ok(())
    }

    /// Login cookie duration as a [`Duration`]
    pub fn login_cookie_duration(&self) -> Duration {
        Duration::from_secs(self.login_cookie_duration_secs)
    }

    /// Provider cookie duration as a [`Duration`]
    pub fn provider_cookie_duration(&self) -> Duration {
        Duration::from_secs(self.provider_cookie_duration_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            provider_cookie_name: default_provider_cookie_name(),
            provider_cookie_duration_secs: default_provider_cookie_duration_secs(),
            login_cookie_duration_secs: default_login_cookie_duration_secs(),
            remote_provider_version: default_remote_provider_version(),
        }
    }
}

fn default_provider_cookie_name() -> String {
    "meshplane-provider".to_string()
}

fn default_provider_cookie_duration_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_login_cookie_duration_secs() -> u64 {
    60 * 60
}

fn default_remote_provider_version() -> String {
    "v0.3.14".to_string()
}

/// Remote preference sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between preference pulls (in milliseconds)
    ///
    /// The first pull happens immediately when the loop starts.
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,

    /// Deadline for a single call to the remote authority (in milliseconds)
    #[serde(default = "default_authority_timeout_ms")]
    pub authority_timeout_ms: u64,
}

impl SyncConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.interval_ms == 0 {
            return Err(crate::Error::config("Sync interval must be > 0"));
        }
        if self.authority_timeout_ms == 0 {
            return Err(crate::Error::config("Authority timeout must be > 0"));
        }
        Ok(())
    }

    /// Sync interval as a [`Duration`]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Authority deadline as a [`Duration`]
    pub fn authority_timeout(&self) -> Duration {
        Duration::from_millis(self.authority_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sync_interval_ms(),
            authority_timeout_ms: default_authority_timeout_ms(),
        }
    }
}

fn default_sync_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_authority_timeout_ms() -> u64 {
    10 * 1000
}

/// Broker bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Topic carrying cluster observation events
    #[serde(default = "default_subscribe_topic")]
    pub subscribe_topic: String,

    /// Capacity of each named channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Deadline for a single broker receive or publish (in milliseconds)
    ///
    /// A receive hitting the deadline is not an error; the link simply polls
    /// its shutdown signal and waits again.
    #[serde(default = "default_broker_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// Capacity of the ingestion event channel used for monitoring
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl BrokerConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.subscribe_topic.is_empty() {
            return Err(crate::Error::config("Broker subscribe topic cannot be empty"));
        }
        if self.channel_capacity == 0 {
            return Err(crate::Error::config("Channel capacity must be > 0"));
        }
        if self.receive_timeout_ms == 0 {
            return Err(crate::Error::config("Broker receive timeout must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }

    /// Broker deadline as a [`Duration`]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscribe_topic: default_subscribe_topic(),
            channel_capacity: default_channel_capacity(),
            receive_timeout_ms: default_broker_timeout_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_subscribe_topic() -> String {
    "meshplane.cluster.events".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_broker_timeout_ms() -> u64 {
    30 * 1000
}

fn default_event_channel_capacity() -> usize {
    1000
}

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name (for logging)
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Maximum number of pending jobs; further enqueues are rejected
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl QueueConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.name.is_empty() {
            return Err(crate::Error::config("Queue name cannot be empty"));
        }
        if self.capacity == 0 {
            return Err(crate::Error::config("Queue capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_name() -> String {
    "loadTestReporterQueue".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ServerConfig::new("/tmp/meshplane");
        assert!(config.validate().is_ok());
        assert_eq!(config.session.login_cookie_duration(), Duration::from_secs(3600));
        assert_eq!(config.session.provider_cookie_name, "meshplane-provider");
    }

    #[test]
    fn malformed_urls_do_not_fail_validation() {
        let config = ServerConfig::new("/tmp/meshplane").with_provider_urls(["not a url"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut config = ServerConfig::new("/tmp/meshplane");
        config.sync.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: ServerConfig =
            serde_json::from_value(serde_json::json!({ "data_dir": "/var/lib/meshplane" }))
                .unwrap();
        assert!(config.provider_base_urls.is_empty());
        assert_eq!(config.queue.name, "loadTestReporterQueue");
        assert_eq!(config.sync.interval_ms, 300_000);
    }
}
