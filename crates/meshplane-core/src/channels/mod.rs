//! Named channels with a stop/drain handshake
//!
//! Every long-lived channel in the control plane is a [`NamedChannel<T>`]:
//! a bounded mpsc queue plus a shared shutdown signal and a done
//! acknowledgement.
//!
//! ## Stop Protocol
//!
//! ```text
//! stop() ──▶ shutdown signal ──▶ producers: send() fails
//!                    │
//!                    └──────────▶ consumer: close, drain buffered items,
//!                                 then recv() yields None and acks
//! stop() returns once the ack arrives
//! ```
//!
//! The queue is closed only by its consumer, after the shutdown signal, so a
//! send never races a raw close. Items accepted before the signal are still
//! delivered.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{Error, Result};
use crate::traits::broker::{BrokerMessage, ClusterSignal};

/// The channels the control plane creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelName {
    /// Broker connection signals
    ClusterSync,
    /// Messages received from the broker
    BrokerInbound,
    /// Messages to publish to the broker
    BrokerOutbound,
}

impl ChannelName {
    /// Stable name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelName::ClusterSync => "cluster-sync",
            ChannelName::BrokerInbound => "broker-inbound",
            ChannelName::BrokerOutbound => "broker-outbound",
        }
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform stop contract over channels of any item type
#[async_trait]
pub trait GenericChannel: Send + Sync {
    /// Channel name
    fn name(&self) -> ChannelName;

    /// Signal shutdown and wait for the consumer to acknowledge
    async fn stop(&self);

    /// Whether `stop()` has been called
    fn is_stopped(&self) -> bool;
}

/// Bounded channel with a shutdown handshake
pub struct NamedChannel<T> {
    name: ChannelName,
    capacity: usize,
    tx: mpsc::Sender<T>,
    shutdown_tx: watch::Sender<bool>,
    consumer: Mutex<Option<ChannelConsumer<T>>>,
    done_rx: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    stopped: AtomicBool,
}

impl<T> std::fmt::Debug for NamedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedChannel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T: Send + 'static> NamedChannel<T> {
    /// Create a channel holding at most `capacity` unconsumed items
    pub fn new(name: ChannelName, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        let consumer = ChannelConsumer {
            name,
            rx,
            shutdown: shutdown_rx,
            draining: false,
            done: Some(done_tx),
        };

        Self {
            name,
            capacity,
            tx,
            shutdown_tx,
            consumer: Mutex::new(Some(consumer)),
            done_rx: tokio::sync::Mutex::new(Some(done_rx)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Capacity of the queue
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A producer handle
    pub fn sender(&self) -> ChannelSender<T> {
        ChannelSender {
            name: self.name,
            tx: self.tx.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        }
    }

    /// Take the single consumer
    ///
    /// # Errors
    ///
    /// - `Error::Channel`: the consumer was already taken, or the channel is stopped
    pub fn take_consumer(&self) -> Result<ChannelConsumer<T>> {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::channel(format!("{}: consumer already taken", self.name)))
    }
}

#[async_trait]
impl<T: Send + 'static> GenericChannel for NamedChannel<T> {
    fn name(&self) -> ChannelName {
        self.name
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!(channel = %self.name, "Stopping channel");
        self.shutdown_tx.send_replace(true);

        // Nobody took the consumer: release it here, which acknowledges
        let unclaimed = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(unclaimed);

        let done = self.done_rx.lock().await.take();
        if let Some(done) = done {
            let _ = done.await;
        }

        tracing::info!(channel = %self.name, "Channel stopped");
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Producer side of a [`NamedChannel`]
#[derive(Debug)]
pub struct ChannelSender<T> {
    name: ChannelName,
    tx: mpsc::Sender<T>,
    shutdown: watch::Receiver<bool>,
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T: Send> ChannelSender<T> {
    /// Name of the channel this sender feeds
    pub fn name(&self) -> ChannelName {
        self.name
    }

    /// Whether the channel has been told to stop
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.tx.is_closed()
    }

    /// Resolves once the channel is told to stop
    pub async fn stopped(&self) {
        let mut shutdown = self.shutdown.clone();
        let _ = shutdown.wait_for(|stopped| *stopped).await;
    }

    fn stopped_error(&self) -> Error {
        Error::channel(format!("{} is stopped", self.name))
    }

    /// Send an item, waiting for capacity
    ///
    /// Fails once the channel is stopping, including while waiting.
    pub async fn send(&self, item: T) -> Result<()> {
        if self.is_closed() {
            return Err(self.stopped_error());
        }

        tokio::select! {
            biased;

            _ = self.stopped() => Err(self.stopped_error()),
            sent = self.tx.send(item) => sent.map_err(|_| self.stopped_error()),
        }
    }

    /// Send without waiting
    ///
    /// # Errors
    ///
    /// - `Error::Channel`: the channel is full or stopping
    pub fn try_send(&self, item: T) -> Result<()> {
        if self.is_closed() {
            return Err(self.stopped_error());
        }

        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => Error::channel(format!("{} is full", self.name)),
            TrySendError::Closed(_) => self.stopped_error(),
        })
    }
}

/// The single consumer of a [`NamedChannel`]
///
/// Dropping the consumer acknowledges the stop handshake.
#[derive(Debug)]
pub struct ChannelConsumer<T> {
    name: ChannelName,
    rx: mpsc::Receiver<T>,
    shutdown: watch::Receiver<bool>,
    draining: bool,
    done: Option<oneshot::Sender<()>>,
}

impl<T> ChannelConsumer<T> {
    /// Name of the channel this consumer drains
    pub fn name(&self) -> ChannelName {
        self.name
    }

    /// Receive the next item
    ///
    /// After shutdown is signalled, yields whatever is still buffered and
    /// then `None`.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if self.draining || *self.shutdown.borrow() {
                return self.drain_one();
            }

            tokio::select! {
                biased;

                item = self.rx.recv() => {
                    return match item {
                        Some(item) => Some(item),
                        None => {
                            self.acknowledge();
                            None
                        }
                    };
                }

                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        self.draining = true;
                    }
                }
            }
        }
    }

    fn drain_one(&mut self) -> Option<T> {
        if !self.draining {
            self.draining = true;
            self.rx.close();
            tracing::debug!(channel = %self.name, "Draining channel");
        }

        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(_) => {
                self.acknowledge();
                None
            }
        }
    }

    fn acknowledge(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
            tracing::debug!(channel = %self.name, "Consumer acknowledged stop");
        }
    }

    /// Acknowledge the stop handshake without draining
    pub fn finish(mut self) {
        self.acknowledge();
    }
}

impl<T> Drop for ChannelConsumer<T> {
    fn drop(&mut self) {
        self.acknowledge();
    }
}

/// The three channels of the broker bridge
#[derive(Debug)]
pub struct ChannelBridge {
    /// Broker connection signals
    pub cluster_sync: NamedChannel<ClusterSignal>,
    /// Messages received from the broker, drained by the ingestion consumer
    pub broker_inbound: NamedChannel<BrokerMessage>,
    /// Messages waiting to be published
    pub broker_outbound: NamedChannel<BrokerMessage>,
}

impl ChannelBridge {
    /// Create all three channels with the same capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            cluster_sync: NamedChannel::new(ChannelName::ClusterSync, capacity),
            broker_inbound: NamedChannel::new(ChannelName::BrokerInbound, capacity),
            broker_outbound: NamedChannel::new(ChannelName::BrokerOutbound, capacity),
        }
    }

    /// The channels in stop order
    pub fn channels(&self) -> [&dyn GenericChannel; 3] {
        [&self.cluster_sync, &self.broker_inbound, &self.broker_outbound]
    }

    /// Stop every channel in order: cluster-sync, broker-inbound, broker-outbound
    pub async fn stop_all(&self) {
        for channel in self.channels() {
            channel.stop().await;
        }
    }

    /// Whether every channel has been stopped
    pub fn is_stopped(&self) -> bool {
        self.channels().iter().all(|c| c.is_stopped())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_and_receive() {
        let channel = NamedChannel::new(ChannelName::BrokerInbound, 4);
        let sender = channel.sender();
        let mut consumer = channel.take_consumer().unwrap();

        sender.send(1u32).await.unwrap();
        sender.try_send(2).unwrap();

        assert_eq!(consumer.recv().await, Some(1));
        assert_eq!(consumer.recv().await, Some(2));
        assert!(channel.take_consumer().is_err());
    }

    #[tokio::test]
    async fn test_debug_reports_stop_state() {
        let channel = NamedChannel::<String>::new(ChannelName::BrokerInbound, 2);
        assert!(format!("{:?}", channel).contains("stopped: false"));

        channel.stop().await;
        assert!(format!("{:?}", channel).contains("stopped: true"));
    }

    #[tokio::test]
    async fn test_stop_drains_buffered_items() {
        let channel = std::sync::Arc::new(NamedChannel::new(ChannelName::BrokerInbound, 8));
        let sender = channel.sender();
        let mut consumer = channel.take_consumer().unwrap();

        for i in 0..3u32 {
            sender.send(i).await.unwrap();
        }

        let stopper = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.stop().await })
        };

        let mut received = Vec::new();
        while let Some(item) = consumer.recv().await {
            received.push(item);
        }
        assert_eq!(received, vec![0, 1, 2]);

        tokio::time::timeout(Duration::from_secs(1), stopper)
            .await
            .expect("stop should return once the consumer acknowledged")
            .unwrap();

        assert!(sender.send(9).await.is_err());
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_stop_waits_for_consumer_ack() {
        let channel = std::sync::Arc::new(NamedChannel::<u32>::new(ChannelName::ClusterSync, 1));
        let consumer = channel.take_consumer().unwrap();

        let stopper = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.stop().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopper.is_finished());

        drop(consumer);
        tokio::time::timeout(Duration::from_secs(1), stopper)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_without_consumer() {
        let channel = NamedChannel::<u32>::new(ChannelName::BrokerOutbound, 1);
        channel.stop().await;
        channel.stop().await;
        assert!(channel.is_stopped());
        assert!(channel.take_consumer().is_err());
    }

    #[tokio::test]
    async fn test_blocked_sender_is_released_by_stop() {
        let channel = std::sync::Arc::new(NamedChannel::new(ChannelName::BrokerInbound, 1));
        let sender = channel.sender();
        sender.send(1u32).await.unwrap();

        let blocked = tokio::spawn(async move { sender.send(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        channel.stop().await;
        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bridge_stops_all_channels() {
        let bridge = ChannelBridge::new(16);
        let names: Vec<_> = bridge.channels().iter().map(|c| c.name().as_str()).collect();
        assert_eq!(names, vec!["cluster-sync", "broker-inbound", "broker-outbound"]);

        bridge.stop_all().await;
        assert!(bridge.is_stopped());
    }
}
