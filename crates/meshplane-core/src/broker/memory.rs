// # Memory Broker
//
// In-process implementation of BrokerConnection.
//
// ## Purpose
//
// Lets the control plane run without an external broker (embedding, tests).
// Messages published to a topic are delivered to every live subscriber of
// that topic. Connection loss can be simulated with `disconnect()` and
// `connect()`, which end all subscriptions and emit the matching signals.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::Error;
use crate::traits::broker::{
    BrokerConnection, BrokerMessage, ClusterSignal, MessageStream, SignalStream,
};

/// In-memory broker
///
/// # Example
///
/// ```rust,no_run
/// use meshplane_core::broker::MemoryBroker;
/// use meshplane_core::traits::{BrokerConnection, BrokerMessage, EventType};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let broker = MemoryBroker::new();
///     let mut events = broker.subscribe("meshplane.cluster.events").await?;
///
///     let message = BrokerMessage::new("meshplane.cluster.events", "KeyValue", EventType::Added, b"{}".to_vec());
///     broker.publish("meshplane.cluster.events", message).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct MemoryBroker {
    connected: AtomicBool,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BrokerMessage>>>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<ClusterSignal>>>,
    published: Mutex<Vec<BrokerMessage>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a connected broker with no subscribers
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            subscribers: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Whether the broker currently accepts subscriptions and publishes
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Simulate connection loss: every subscription stream ends
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.signal(ClusterSignal::Disconnected);
        tracing::debug!("Memory broker disconnected");
    }

    /// Simulate reconnection
    pub fn connect(&self) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.signal(ClusterSignal::Connected);
        tracing::debug!("Memory broker connected");
    }

    /// Number of live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Every message published so far, oldest first
    pub fn published(&self) -> Vec<BrokerMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn signal(&self, signal: ClusterSignal) {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(signal).is_ok());
    }
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, Error> {
        if !self.is_connected() {
            return Err(Error::broker("Memory broker is disconnected"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        tracing::debug!(topic, "Memory broker subscription added");
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn publish(&self, topic: &str, message: BrokerMessage) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::broker("Memory broker is disconnected"));
        }

        if let Some(subs) = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(topic)
        {
            subs.retain(|tx| tx.send(message.clone()).is_ok());
        }

        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }

    fn connection_events(&self) -> SignalStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    fn broker_name(&self) -> &'static str {
        "memory"
    }
}
