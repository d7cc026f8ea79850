// # meshplaned - control plane daemon
//
// A thin integration layer: all control-plane logic lives in meshplane-core.
//
// The daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Wiring the HTTP authority, broker and metrics handler into the core
// 4. Running until SIGINT/SIGTERM, then shutting down in order
//
// ## Configuration
//
// - `MESHPLANE_PROVIDER_BASE_URLS`: Comma-separated remote provider base URLs
// - `MESHPLANE_DATA_DIR`: Storage directory (default `$HOME/.meshplane/config`)
// - `MESHPLANE_LOGIN_COOKIE_DURATION_SECS`: Remote login lifetime (default 3600)
// - `MESHPLANE_SYNC_INTERVAL_SECS`: Preference sync interval (default 300)
// - `MESHPLANE_PORT`: Port reported for the surrounding server (default 9081)
// - `MESHPLANE_METRICS_URL`: Metrics collector base URL (optional)
// - `MESHPLANE_ANONYMOUS_RESULTS_TOKEN`: Token for anonymous results (optional)
// - `MESHPLANE_BUILD`, `MESHPLANE_RELEASE_CHANNEL`: Reported at startup
// - `MESHPLANE_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Example
//
// ```bash
// export MESHPLANE_PROVIDER_BASE_URLS=https://cloud.example.com
// export MESHPLANE_DATA_DIR=/var/lib/meshplane
// meshplaned
// ```

use anyhow::Result;
use meshplane_core::traits::{Job, JobHandler};
use meshplane_core::{Collaborators, ControlPlane, MemoryBroker, ServerConfig};
use meshplane_remote::{HttpAuthorityFactory, HttpMetricsSubmitter};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use url::Url;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Upper bound on the ordered shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for each metrics submission
const METRICS_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// - 0: Clean shutdown
/// - 1: Configuration or startup error (including unusable storage)
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum MeshplaneExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<MeshplaneExitCode> for ExitCode {
    fn from(code: MeshplaneExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon configuration
#[derive(Debug)]
struct Config {
    provider_base_urls: Vec<String>,
    data_dir: PathBuf,
    login_cookie_duration_secs: Option<u64>,
    sync_interval_secs: Option<u64>,
    port: u16,
    metrics_url: Option<String>,
    anonymous_results_token: Option<String>,
    build: String,
    release_channel: String,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| -> Result<Option<u64>> {
            match lookup(key).filter(|v| !v.trim().is_empty()) {
                Some(v) => v
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|e| anyhow::anyhow!("{} must be a number ({}): {}", key, v, e)),
                None => Ok(None),
            }
        };

        let data_dir = match lookup("MESHPLANE_DATA_DIR").filter(|v| !v.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = lookup("HOME").filter(|v| !v.is_empty()).ok_or_else(|| {
                    anyhow::anyhow!("MESHPLANE_DATA_DIR is not set and HOME is unknown")
                })?;
                PathBuf::from(home).join(".meshplane").join("config")
            }
        };

        let port = match number("MESHPLANE_PORT")? {
            Some(port) => u16::try_from(port)
                .map_err(|_| anyhow::anyhow!("MESHPLANE_PORT out of range: {}", port))?,
            None => 9081,
        };

        Ok(Self {
            provider_base_urls: lookup("MESHPLANE_PROVIDER_BASE_URLS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            data_dir,
            login_cookie_duration_secs: number("MESHPLANE_LOGIN_COOKIE_DURATION_SECS")?,
            sync_interval_secs: number("MESHPLANE_SYNC_INTERVAL_SECS")?,
            port,
            metrics_url: lookup("MESHPLANE_METRICS_URL").filter(|v| !v.is_empty()),
            anonymous_results_token: lookup("MESHPLANE_ANONYMOUS_RESULTS_TOKEN")
                .filter(|v| !v.is_empty()),
            build: lookup("MESHPLANE_BUILD").unwrap_or_else(|| "dev".to_string()),
            release_channel: lookup("MESHPLANE_RELEASE_CHANNEL")
                .unwrap_or_else(|| "edge".to_string()),
            log_level: lookup("MESHPLANE_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate ranges and formats
    ///
    /// Provider URLs are not checked: a malformed one only disables that
    /// provider at startup.
    fn validate(&self) -> Result<()> {
        if let Some(secs) = self.login_cookie_duration_secs
            && !(60..=30 * 24 * 3600).contains(&secs)
        {
            anyhow::bail!(
                "MESHPLANE_LOGIN_COOKIE_DURATION_SECS must be between 60 and 2592000 seconds. Got: {}",
                secs
            );
        }

        if let Some(secs) = self.sync_interval_secs
            && !(1..=24 * 3600).contains(&secs)
        {
            anyhow::bail!(
                "MESHPLANE_SYNC_INTERVAL_SECS must be between 1 and 86400 seconds. Got: {}",
                secs
            );
        }

        if self.port == 0 {
            anyhow::bail!("MESHPLANE_PORT cannot be 0");
        }

        if let Some(ref url) = self.metrics_url {
            let parsed = Url::parse(url)
                .map_err(|e| anyhow::anyhow!("MESHPLANE_METRICS_URL is not a URL ({}): {}", url, e))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("MESHPLANE_METRICS_URL must use HTTP or HTTPS. Got: {}", url);
            }
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "MESHPLANE_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(self.data_dir.clone())
            .with_provider_urls(self.provider_base_urls.iter().cloned());
        config.anonymous_results_token = self.anonymous_results_token.clone();
        if let Some(secs) = self.login_cookie_duration_secs {
            config.session.login_cookie_duration_secs = secs;
        }
        if let Some(secs) = self.sync_interval_secs {
            config.sync.interval_ms = secs * 1000;
        }
        config
    }
}

/// Metrics handler used when no collector is configured
struct LoggingMetricsHandler;

#[async_trait::async_trait]
impl JobHandler for LoggingMetricsHandler {
    async fn handle(&self, job: Job) -> meshplane_core::Result<()> {
        info!(job = %job.name, payload = %job.payload, "Metrics collected (no collector configured)");
        Ok(())
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return MeshplaneExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return MeshplaneExitCode::ConfigError.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return MeshplaneExitCode::ConfigError.into();
    }

    info!(
        build = %config.build,
        channel = %config.release_channel,
        port = config.port,
        "Starting meshplaned"
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return MeshplaneExitCode::RuntimeError.into();
        }
    };

    rt.block_on(run_daemon(config)).into()
}

/// Start the control plane, wait for a signal, shut down
async fn run_daemon(config: Config) -> MeshplaneExitCode {
    let metrics_handler: Arc<dyn JobHandler> = match build_metrics_handler(&config) {
        Ok(handler) => handler,
        Err(e) => {
            error!("Failed to create metrics handler: {}", e);
            return MeshplaneExitCode::ConfigError;
        }
    };

    let collaborators = Collaborators {
        broker: Arc::new(MemoryBroker::new()),
        authority_factory: Arc::new(HttpAuthorityFactory),
        metrics_handler,
    };

    let (plane, mut events) = match ControlPlane::start(config.server_config(), collaborators).await {
        Ok(started) => started,
        Err(e) => {
            if e.is_fatal() {
                error!("Cannot start: {}", e);
            } else {
                error!("Startup failed: {}", e);
            }
            return MeshplaneExitCode::ConfigError;
        }
    };

    for url in plane.skipped_urls() {
        warn!(url = %url, "Remote provider disabled");
    }
    info!(providers = ?plane.providers().names(), "Control plane ready");

    let monitor = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!(?event, "Ingest event");
        }
    });

    let signal = match wait_for_shutdown_signal().await {
        Ok(signal) => signal,
        Err(e) => {
            error!("Shutdown signal error: {}", e);
            "error"
        }
    };
    info!("Received shutdown signal: {}", signal);

    let code = match tokio::time::timeout(SHUTDOWN_TIMEOUT, plane.shutdown()).await {
        Ok(Ok(())) => MeshplaneExitCode::CleanShutdown,
        Ok(Err(e)) => {
            error!("Shutdown error: {}", e);
            MeshplaneExitCode::RuntimeError
        }
        Err(_) => {
            error!("Shutdown timeout after {:?}", SHUTDOWN_TIMEOUT);
            MeshplaneExitCode::RuntimeError
        }
    };

    monitor.abort();
    code
}

fn build_metrics_handler(config: &Config) -> Result<Arc<dyn JobHandler>> {
    match &config.metrics_url {
        Some(url) => {
            let base = Url::parse(url)?;
            let submitter = HttpMetricsSubmitter::new(
                &base,
                config.anonymous_results_token.clone(),
                METRICS_TIMEOUT,
            )?;
            info!(endpoint = %submitter.endpoint(), "Submitting metrics over HTTP");
            Ok(Arc::new(submitter))
        }
        None => Ok(Arc::new(LoggingMetricsHandler)),
    }
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
