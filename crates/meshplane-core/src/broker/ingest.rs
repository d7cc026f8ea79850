//! Broker-to-storage ingestion
//!
//! Classifies each inbound [`BrokerMessage`] by object kind, extracts the
//! record's natural identifier and applies it to the matching domain
//! persister. Messages are applied one at a time, in receipt order.
//!
//! | kind                 | domain              | identifier |
//! |----------------------|---------------------|------------|
//! | `Object`             | ClusterObjects      | `metadata.uid`, else `metadata.namespace/metadata.name` |
//! | `KeyValue`           | ClusterKeyValues    | `key` |
//! | `PerformanceProfile` | PerformanceProfiles | `id` |
//! | `Result`             | Results             | `id` |
//! | `Pattern`            | Patterns            | `id` |
//! | `Filter`             | Filters             | `id` |
//! | `Application`        | Applications        | `id` |
//! | `PatternResource`    | PatternResources    | `id` |

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{Error, Result};
use crate::persister::PersisterSet;
use crate::traits::broker::{BrokerMessage, EventType};
use crate::traits::persister::Domain;

/// Object kinds the ingestion consumer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Object,
    KeyValue,
    PerformanceProfile,
    Result,
    Pattern,
    Filter,
    Application,
    PatternResource,
}

impl ObjectKind {
    /// Classify a declared kind; `None` for kinds we do not store
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Object" => Some(Self::Object),
            "KeyValue" => Some(Self::KeyValue),
            "PerformanceProfile" => Some(Self::PerformanceProfile),
            "Result" => Some(Self::Result),
            "Pattern" => Some(Self::Pattern),
            "Filter" => Some(Self::Filter),
            "Application" => Some(Self::Application),
            "PatternResource" => Some(Self::PatternResource),
            _ => None,
        }
    }

    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Object => "Object",
            Self::KeyValue => "KeyValue",
            Self::PerformanceProfile => "PerformanceProfile",
            Self::Result => "Result",
            Self::Pattern => "Pattern",
            Self::Filter => "Filter",
            Self::Application => "Application",
            Self::PatternResource => "PatternResource",
        }
    }

    /// Domain records of this kind are stored in
    pub fn domain(&self) -> Domain {
        match self {
            Self::Object => Domain::ClusterObjects,
            Self::KeyValue => Domain::ClusterKeyValues,
            Self::PerformanceProfile => Domain::PerformanceProfiles,
            Self::Result => Domain::Results,
            Self::Pattern => Domain::Patterns,
            Self::Filter => Domain::Filters,
            Self::Application => Domain::Applications,
            Self::PatternResource => Domain::PatternResources,
        }
    }

    /// Natural identifier of `object`
    ///
    /// Cluster-scoped objects without a uid are keyed by name alone.
    pub fn identifier(&self, object: &Value) -> Option<String> {
        match self {
            Self::Object => {
                let metadata = object.get("metadata")?;
                if let Some(uid) = non_empty(metadata.get("uid")) {
                    return Some(uid);
                }
                let name = non_empty(metadata.get("name"))?;
                match non_empty(metadata.get("namespace")) {
                    Some(namespace) => Some(format!("{}/{}", namespace, name)),
                    None => Some(name),
                }
            }
            Self::KeyValue => non_empty(object.get("key")),
            _ => non_empty(object.get("id")),
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// String or numeric identifier, rejecting empty strings
fn non_empty(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEvent {
    /// Record created or replaced
    Upserted { kind: ObjectKind, key: String },
    /// Record removed
    Deleted { kind: ObjectKind, key: String },
    /// Message dropped without touching storage
    Dropped { kind: String, reason: String },
}

/// Ingestion counters
#[derive(Debug, Default)]
pub struct IngestStats {
    upserted: AtomicU64,
    deleted: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestStatsSnapshot {
    pub upserted: u64,
    pub deleted: u64,
    pub dropped: u64,
}

impl IngestStats {
    /// Read all counters
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            upserted: self.upserted.load(Ordering::SeqCst),
            deleted: self.deleted.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
        }
    }
}

/// Applies broker messages to the persister set
#[derive(Debug)]
pub struct Ingestor {
    persisters: Arc<PersisterSet>,
    stats: Arc<IngestStats>,
    event_tx: Option<mpsc::Sender<IngestEvent>>,
}

impl Ingestor {
    /// Create an ingestor writing into `persisters`
    pub fn new(persisters: Arc<PersisterSet>) -> Self {
        Self {
            persisters,
            stats: Arc::new(IngestStats::default()),
            event_tx: None,
        }
    }

    /// Also report every outcome on a bounded channel
    pub fn with_events(mut self, capacity: usize) -> (Self, mpsc::Receiver<IngestEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.event_tx = Some(tx);
        (self, rx)
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Apply one message
    ///
    /// # Errors
    ///
    /// - `Error::UnknownObjectKind`: the kind is not in the table
    /// - `Error::Json`: the payload is not JSON
    /// - `Error::Broker`: the payload has no identifier
    /// - persister errors from the write itself
    pub async fn apply(&self, message: &BrokerMessage) -> Result<IngestEvent> {
        let kind = ObjectKind::from_kind(&message.kind)
            .ok_or_else(|| Error::unknown_object_kind(&message.kind))?;

        let object: Value = serde_json::from_slice(&message.payload)?;
        let key = kind.identifier(&object).ok_or_else(|| {
            Error::broker(format!("{} payload has no identifier", kind))
        })?;

        let persister = self.persisters.persister(kind.domain())?;
        match message.event {
            EventType::Deleted => {
                persister.delete(&key).await?;
                Ok(IngestEvent::Deleted { kind, key })
            }
            EventType::Added | EventType::Modified => {
                persister.put(&key, &object).await?;
                Ok(IngestEvent::Upserted { kind, key })
            }
        }
    }

    /// Apply one message, logging and counting instead of failing
    pub async fn ingest(&self, message: &BrokerMessage) {
        let event = match self.apply(message).await {
            Ok(event) => {
                match &event {
                    IngestEvent::Deleted { kind, key } => {
                        self.stats.deleted.fetch_add(1, Ordering::SeqCst);
                        tracing::debug!(%kind, key = %key, "Cluster record deleted");
                    }
                    _ => {
                        self.stats.upserted.fetch_add(1, Ordering::SeqCst);
                        tracing::trace!(kind = %message.kind, "Cluster record stored");
                    }
                }
                event
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    kind = %message.kind,
                    subject = %message.subject,
                    "Dropping broker message: {}",
                    e
                );
                IngestEvent::Dropped {
                    kind: message.kind.clone(),
                    reason: e.to_string(),
                }
            }
        };

        self.emit_event(event);
    }

    fn emit_event(&self, event: IngestEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };

        if let Err(TrySendError::Full(_)) = tx.try_send(event) {
            tracing::warn!("Ingest event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}
