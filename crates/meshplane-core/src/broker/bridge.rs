//! Broker bridge tasks
//!
//! Connects a [`BrokerConnection`] to the [`ChannelBridge`]:
//!
//! ```text
//!  broker.connection_events() ──watcher──▶ cluster-sync ──┐
//!                                                         ▼
//!  broker.subscribe(topic) ─────────────────────────────link──▶ broker-inbound ──ingestor──▶ PersisterSet
//!
//!  broker-outbound ──publisher──▶ broker.publish(message.subject)
//! ```
//!
//! Each task ends when the channel it consumes is stopped, so stopping the
//! channels in order (cluster-sync, broker-inbound, broker-outbound) winds
//! the bridge down and drains whatever was already accepted.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::broker::ingest::{IngestEvent, IngestStats, IngestStatsSnapshot, Ingestor};
use crate::channels::{ChannelBridge, ChannelConsumer, ChannelSender};
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::persister::PersisterSet;
use crate::traits::broker::{BrokerConnection, BrokerMessage, ClusterSignal, MessageStream};

/// Running bridge tasks
#[derive(Debug)]
pub struct BridgeHandle {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    stats: Arc<IngestStats>,
}

impl BridgeHandle {
    /// Ingestion counters
    pub fn stats(&self) -> IngestStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait for every task to finish
    ///
    /// Call after the channels have been stopped.
    pub async fn join(self) {
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(task = name, "Broker bridge task failed: {}", e);
            }
        }
        tracing::debug!("Broker bridge tasks joined");
    }
}

/// Spawns the bridge tasks
pub struct BrokerBridge;

impl BrokerBridge {
    /// Start the watcher, link, ingestor and publisher tasks
    ///
    /// Takes the consumers of all three channels.
    ///
    /// # Returns
    ///
    /// A tuple of (handle, event_receiver) where event_receiver yields one
    /// [`IngestEvent`] per inbound message
    pub fn start(
        broker: Arc<dyn BrokerConnection>,
        channels: &ChannelBridge,
        persisters: Arc<PersisterSet>,
        config: &BrokerConfig,
    ) -> Result<(BridgeHandle, mpsc::Receiver<IngestEvent>)> {
        let signals = channels.cluster_sync.take_consumer()?;
        let inbound = channels.broker_inbound.take_consumer()?;
        let outbound = channels.broker_outbound.take_consumer()?;

        let (ingestor, events) = Ingestor::new(persisters).with_events(config.event_channel_capacity);
        let stats = ingestor.stats();
        let deadline = config.receive_timeout();

        let tasks = vec![
            (
                "watcher",
                tokio::spawn(watch_connection(
                    Arc::clone(&broker),
                    channels.cluster_sync.sender(),
                )),
            ),
            (
                "link",
                tokio::spawn(link(
                    Arc::clone(&broker),
                    config.subscribe_topic.clone(),
                    signals,
                    channels.broker_inbound.sender(),
                    deadline,
                )),
            ),
            ("ingestor", tokio::spawn(consume_inbound(inbound, ingestor))),
            (
                "publisher",
                tokio::spawn(publish_outbound(Arc::clone(&broker), outbound, deadline)),
            ),
        ];

        tracing::info!(
            broker = broker.broker_name(),
            topic = %config.subscribe_topic,
            "Broker bridge started"
        );

        Ok((BridgeHandle { tasks, stats }, events))
    }
}

/// Forward connection signals into cluster-sync
async fn watch_connection(broker: Arc<dyn BrokerConnection>, signals: ChannelSender<ClusterSignal>) {
    let mut events = broker.connection_events();

    loop {
        tokio::select! {
            biased;

            _ = signals.stopped() => break,

            event = events.next() => {
                let Some(signal) = event else {
                    tracing::debug!("Broker connection event stream ended");
                    break;
                };
                tracing::info!(?signal, "Broker connection changed");
                if signals.send(signal).await.is_err() {
                    break;
                }
            }
        }
    }
}

enum Received {
    Message(BrokerMessage),
    Ended,
    Idle,
}

async fn next_message(stream: &mut Option<MessageStream>, deadline: Duration) -> Received {
    let Some(stream) = stream.as_mut() else {
        return std::future::pending().await;
    };

    match tokio::time::timeout(deadline, stream.next()).await {
        Ok(Some(message)) => Received::Message(message),
        Ok(None) => Received::Ended,
        Err(_) => Received::Idle,
    }
}

async fn subscribe(broker: &dyn BrokerConnection, topic: &str) -> Option<MessageStream> {
    match broker.subscribe(topic).await {
        Ok(stream) => {
            tracing::info!(topic, "Subscribed to broker topic");
            Some(stream)
        }
        Err(e) => {
            tracing::warn!(topic, "Broker subscription failed, waiting for reconnect: {}", e);
            None
        }
    }
}

/// Keep a subscription alive and forward its messages into broker-inbound
///
/// Exits when cluster-sync is stopped.
async fn link(
    broker: Arc<dyn BrokerConnection>,
    topic: String,
    mut signals: ChannelConsumer<ClusterSignal>,
    inbound: ChannelSender<BrokerMessage>,
    deadline: Duration,
) {
    let mut stream = subscribe(broker.as_ref(), &topic).await;

    loop {
        tokio::select! {
            biased;

            signal = signals.recv() => match signal {
                Some(ClusterSignal::Connected) => {
                    stream = subscribe(broker.as_ref(), &topic).await;
                }
                Some(ClusterSignal::Disconnected) => {
                    stream = None;
                }
                None => break,
            },

            received = next_message(&mut stream, deadline) => match received {
                Received::Message(message) => {
                    if let Err(e) = inbound.send(message).await {
                        tracing::debug!("Inbound channel closed: {}", e);
                        break;
                    }
                }
                Received::Ended => {
                    tracing::warn!(topic = %topic, "Broker subscription ended");
                    stream = None;
                }
                Received::Idle => {}
            },
        }
    }

    tracing::debug!("Broker link exited");
}

/// The single inbound consumer
async fn consume_inbound(mut inbound: ChannelConsumer<BrokerMessage>, ingestor: Ingestor) {
    while let Some(message) = inbound.recv().await {
        ingestor.ingest(&message).await;
    }
    tracing::debug!("Ingestion consumer exited");
}

/// Publish each outbound message to its subject
async fn publish_outbound(
    broker: Arc<dyn BrokerConnection>,
    mut outbound: ChannelConsumer<BrokerMessage>,
    deadline: Duration,
) {
    while let Some(message) = outbound.recv().await {
        let subject = message.subject.clone();
        match tokio::time::timeout(deadline, broker.publish(&subject, message)).await {
            Ok(Ok(())) => tracing::trace!(subject = %subject, "Published broker message"),
            Ok(Err(e)) => tracing::warn!(subject = %subject, "Publish failed: {}", e),
            Err(_) => tracing::warn!(subject = %subject, "Publish timed out after {:?}", deadline),
        }
    }
    tracing::debug!("Outbound publisher exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::channels::GenericChannel;
    use crate::traits::broker::EventType;
    use crate::traits::persister::Domain;
    use serde_json::json;

    const TOPIC: &str = "meshplane.cluster.events";

    async fn wait_for_subscriber(broker: &MemoryBroker) {
        for _ in 0..100 {
            if broker.subscriber_count(TOPIC) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("link never subscribed");
    }

    #[tokio::test]
    async fn test_inbound_messages_reach_storage() {
        let broker = Arc::new(MemoryBroker::new());
        let channels = ChannelBridge::new(16);
        let persisters = Arc::new(PersisterSet::in_memory());

        let (handle, mut events) = BrokerBridge::start(
            broker.clone(),
            &channels,
            persisters.clone(),
            &BrokerConfig::default(),
        )
        .unwrap();
        wait_for_subscriber(&broker).await;

        let message = BrokerMessage::from_json(
            TOPIC,
            "Pattern",
            EventType::Added,
            &json!({ "id": "p-1", "name": "canary" }),
        )
        .unwrap();
        broker.publish(TOPIC, message).await.unwrap();

        assert!(matches!(events.recv().await, Some(IngestEvent::Upserted { .. })));
        let stored = persisters
            .persister(Domain::Patterns)
            .unwrap()
            .get("p-1")
            .await
            .unwrap();
        assert_eq!(stored, Some(json!({ "id": "p-1", "name": "canary" })));

        channels.stop_all().await;
        handle.join().await;
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes() {
        let broker = Arc::new(MemoryBroker::new());
        let channels = ChannelBridge::new(16);
        let persisters = Arc::new(PersisterSet::in_memory());

        let (handle, mut events) = BrokerBridge::start(
            broker.clone(),
            &channels,
            persisters.clone(),
            &BrokerConfig::default(),
        )
        .unwrap();
        wait_for_subscriber(&broker).await;

        broker.disconnect();
        broker.connect();
        wait_for_subscriber(&broker).await;

        let message =
            BrokerMessage::from_json(TOPIC, "KeyValue", EventType::Added, &json!({ "key": "k" }))
                .unwrap();
        broker.publish(TOPIC, message).await.unwrap();
        assert!(matches!(events.recv().await, Some(IngestEvent::Upserted { .. })));

        channels.stop_all().await;
        handle.join().await;
    }

    #[tokio::test]
    async fn test_outbound_messages_are_published() {
        let broker = Arc::new(MemoryBroker::new());
        let channels = ChannelBridge::new(16);
        let (handle, _events) = BrokerBridge::start(
            broker.clone(),
            &channels,
            Arc::new(PersisterSet::in_memory()),
            &BrokerConfig::default(),
        )
        .unwrap();

        let outbound = channels.broker_outbound.sender();
        outbound
            .send(BrokerMessage::new("meshplane.commands", "Command", EventType::Added, b"{}".to_vec()))
            .await
            .unwrap();

        // Stopping drains what was accepted before the signal
        channels.cluster_sync.stop().await;
        channels.broker_inbound.stop().await;
        channels.broker_outbound.stop().await;
        handle.join().await;

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject, "meshplane.commands");
    }
}
