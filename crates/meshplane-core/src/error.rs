//! Error types for the meshplane core
//!
//! Only [`Error::FatalInit`] is allowed to abort startup. Every other variant
//! is scoped to the provider, channel or job that produced it.

use thiserror::Error;

/// Result type alias for meshplane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    /// A persister or the schema migration failed to open; the process must not start
    #[error("Fatal initialization error: {0}")]
    FatalInit(String),

    /// A configured remote provider URL is malformed; that provider is skipped
    #[error("Invalid provider URL '{url}': {reason}")]
    InvalidProviderUrl {
        /// The raw URL as configured
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// The remote authority could not be reached during a preference pull
    #[error("Transient sync failure ({provider}): {message}")]
    TransientSync {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
    },

    /// A broker payload could not be classified
    #[error("Unknown object kind: {0}")]
    UnknownObjectKind(String),

    /// A task-queue job failed or could not be accepted
    #[error("Job failure ({job}): {message}")]
    JobFailure {
        /// Job name
        job: String,
        /// Error message
        message: String,
    },

    /// Persister-related errors
    #[error("Persister error: {0}")]
    Persister(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel errors (stopped channel, missing consumer)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Broker connection errors
    #[error("Broker error: {0}")]
    Broker(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// HTTP client errors (from the remote authority)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Lookup miss (provider, record, persister domain)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a fatal initialization error
    pub fn fatal_init(msg: impl Into<String>) -> Self {
        Self::FatalInit(msg.into())
    }

    /// Create an invalid provider URL error
    pub fn invalid_provider_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProviderUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a transient sync error
    pub fn transient_sync(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientSync {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an unknown object kind error
    pub fn unknown_object_kind(kind: impl Into<String>) -> Self {
        Self::UnknownObjectKind(kind.into())
    }

    /// Create a job failure
    pub fn job_failure(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self::JobFailure {
            job: job.into(),
            message: message.into(),
        }
    }

    /// Create a persister error
    pub fn persister(msg: impl Into<String>) -> Self {
        Self::Persister(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Create a broker error
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether this error must abort process startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalInit(_))
    }

    /// Promote any error raised while opening storage to [`Error::FatalInit`]
    pub fn into_fatal(self) -> Self {
        match self {
            Self::FatalInit(_) => self,
            other => Self::FatalInit(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persister(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
