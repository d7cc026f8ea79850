// # Broker Connection Trait
//
// Defines the publish/subscribe transport the channel bridge consumes.
//
// ## Implementations
//
// - In-memory: `broker::MemoryBroker` (embedding, tests)
// - Future: NATS, Kafka
//
// ## Usage
//
// ```rust,ignore
// use meshplane_core::traits::BrokerConnection;
// use tokio_stream::StreamExt;
//
// let broker = /* BrokerConnection implementation */;
// let mut messages = broker.subscribe("meshplane.cluster.events").await?;
// while let Some(message) = messages.next().await {
//     println!("{} {}", message.kind, message.subject);
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Kind of change an observation event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A message travelling through the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Topic the message was received on, or is published to
    pub subject: String,
    /// Declared object kind of the payload (e.g. "Object", "KeyValue")
    pub kind: String,
    /// Change type
    pub event: EventType,
    /// Serialized object (JSON)
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    /// Create a message from raw payload bytes
    pub fn new(
        subject: impl Into<String>,
        kind: impl Into<String>,
        event: EventType,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            subject: subject.into(),
            kind: kind.into(),
            event,
            payload: payload.into(),
        }
    }

    /// Create a message whose payload is the JSON encoding of `object`
    pub fn from_json(
        subject: impl Into<String>,
        kind: impl Into<String>,
        event: EventType,
        object: &serde_json::Value,
    ) -> Result<Self, crate::Error> {
        Ok(Self::new(subject, kind, event, serde_json::to_vec(object)?))
    }
}

/// Liveness signal carried on the cluster-sync channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterSignal {
    /// Broker connection (re-)established; subscriptions must be renewed
    Connected,
    /// Broker connection lost
    Disconnected,
}

/// Stream of inbound broker messages
pub type MessageStream = Pin<Box<dyn Stream<Item = BrokerMessage> + Send + 'static>>;

/// Stream of connection lifecycle signals
pub type SignalStream = Pin<Box<dyn Stream<Item = ClusterSignal> + Send + 'static>>;

/// Trait for broker connection implementations
///
/// The connection is an opaque handle supplied by the surrounding server.
/// Reconnection policy is the implementation's business; it reports the
/// outcome through [`BrokerConnection::connection_events`].
///
/// # Trust Level: Semi-Trusted
///
/// ## Allowed Capabilities
/// - ✅ Perform network I/O to the broker
/// - ✅ Spawn tasks for event delivery (must end when the stream is dropped)
///
/// ## Forbidden Capabilities
/// - ❌ Access persisters (owned by the ingestion consumer)
/// - ❌ Interpret message payloads
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Subscribe to a topic
    ///
    /// The returned stream ends when the connection drops; the bridge
    /// subscribes again on the next [`ClusterSignal::Connected`].
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, crate::Error>;

    /// Publish a message to a topic
    async fn publish(&self, topic: &str, message: BrokerMessage) -> Result<(), crate::Error>;

    /// Watch connection lifecycle changes
    ///
    /// Each call returns an independent stream.
    fn connection_events(&self) -> SignalStream;

    /// Broker name (for logging/debugging)
    fn broker_name(&self) -> &'static str;
}
