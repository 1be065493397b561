//! Broker abstraction and the in-process default broker.
//!
//! The broker is the only subsystem that touches cross-session state:
//! sessions bind to it, subscriptions are recorded against it, and
//! `publish` fans a message out to every subscribed session. The server
//! itself never iterates sessions to deliver channel traffic.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Default broadcast capacity per channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// A broker failure.
///
/// `warning` carries the broker's severity classification: the server
/// demotes warning-class bind failures to `warning` events instead of
/// hard socket errors.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BrokerError {
    /// Broker-supplied reason.
    pub message: String,
    /// Whether the failure should be demoted to a warning.
    pub warning: bool,
}

impl BrokerError {
    /// Create a hard broker error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            warning: false,
        }
    }

    /// Create a warning-class broker error.
    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            warning: true,
        }
    }
}

/// A message fanned out on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    /// Source channel.
    pub channel: String,
    /// Published value.
    pub data: Option<Value>,
}

/// The pub/sub substrate sessions bind to.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Resolves once the broker is ready to accept bindings.
    async fn ready(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Register a session against the subscription index.
    async fn bind(&self, socket_id: &str) -> Result<(), BrokerError>;

    /// Release a session and drain all of its subscriptions.
    async fn unbind(&self, socket_id: &str) -> Result<(), BrokerError>;

    /// Subscribe a bound session to a channel.
    ///
    /// Returns a receiver carrying every publish on that channel.
    async fn subscribe(
        &self,
        socket_id: &str,
        channel: &str,
    ) -> Result<broadcast::Receiver<Arc<ChannelMessage>>, BrokerError>;

    /// Unsubscribe a session from a channel.
    async fn unsubscribe(&self, socket_id: &str, channel: &str) -> Result<(), BrokerError>;

    /// Publish to a channel; returns the number of receivers.
    async fn publish(&self, channel: &str, data: Option<Value>) -> Result<usize, BrokerError>;

    /// Number of sessions subscribed to a channel.
    fn subscriber_count(&self, channel: &str) -> usize;

    /// Whether a channel currently exists.
    fn channel_exists(&self, channel: &str) -> bool;

    /// Number of live channels.
    fn channel_count(&self) -> usize;
}

/// Cloneable publish handle over a broker.
#[derive(Clone)]
pub struct Exchange {
    broker: Arc<dyn Broker>,
}

impl Exchange {
    /// Create an exchange over the given broker.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publish to a channel; returns the number of receivers.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the publish.
    pub async fn publish(
        &self,
        channel: &str,
        data: Option<Value>,
    ) -> Result<usize, BrokerError> {
        self.broker.publish(channel, data).await
    }
}

struct ChannelEntry {
    sender: broadcast::Sender<Arc<ChannelMessage>>,
    subscribers: HashSet<String>,
}

impl ChannelEntry {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: HashSet::new(),
        }
    }
}

/// The default in-process broker.
///
/// Channels are created on first subscribe and deleted when their last
/// subscriber leaves.
pub struct MemoryBroker {
    channels: DashMap<String, ChannelEntry>,
    subscriptions: DashMap<String, DashSet<String>>,
    bound: DashSet<String>,
    capacity: usize,
}

impl MemoryBroker {
    /// Create a broker with default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a broker with a specific per-channel broadcast capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            subscriptions: DashMap::new(),
            bound: DashSet::new(),
            capacity,
        }
    }

    fn drop_if_empty(&self, channel: &str) {
        let empty = self
            .channels
            .get(channel)
            .map(|entry| entry.subscribers.is_empty())
            .unwrap_or(false);
        if empty {
            self.channels.remove(channel);
            debug!(channel = %channel, "Deleted empty channel");
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn bind(&self, socket_id: &str) -> Result<(), BrokerError> {
        self.bound.insert(socket_id.to_string());
        debug!(socket = %socket_id, "Socket bound to broker");
        Ok(())
    }

    async fn unbind(&self, socket_id: &str) -> Result<(), BrokerError> {
        self.bound.remove(socket_id);

        if let Some((_, channels)) = self.subscriptions.remove(socket_id) {
            for channel in channels.iter() {
                if let Some(mut entry) = self.channels.get_mut(channel.as_str()) {
                    entry.subscribers.remove(socket_id);
                }
                self.drop_if_empty(channel.as_str());
            }
        }

        debug!(socket = %socket_id, "Socket unbound from broker");
        Ok(())
    }

    async fn subscribe(
        &self,
        socket_id: &str,
        channel: &str,
    ) -> Result<broadcast::Receiver<Arc<ChannelMessage>>, BrokerError> {
        validate_channel_name(channel).map_err(BrokerError::new)?;

        if !self.bound.contains(socket_id) {
            return Err(BrokerError::new(format!(
                "Socket {socket_id} is not bound to the broker"
            )));
        }

        let socket_channels = self
            .subscriptions
            .entry(socket_id.to_string())
            .or_default();
        if socket_channels.contains(channel) {
            return Err(BrokerError::new(format!(
                "Socket {socket_id} is already subscribed to {channel}"
            )));
        }

        let mut entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel, "Creating new channel");
                ChannelEntry::new(self.capacity)
            });

        entry.subscribers.insert(socket_id.to_string());
        let receiver = entry.sender.subscribe();
        socket_channels.insert(channel.to_string());

        debug!(
            channel = %channel,
            socket = %socket_id,
            subscribers = entry.subscribers.len(),
            "Subscribed"
        );

        Ok(receiver)
    }

    async fn unsubscribe(&self, socket_id: &str, channel: &str) -> Result<(), BrokerError> {
        let subscribed = self
            .subscriptions
            .get(socket_id)
            .map(|channels| channels.remove(channel).is_some())
            .unwrap_or(false);

        if !subscribed {
            return Err(BrokerError::new(format!(
                "Socket {socket_id} is not subscribed to {channel}"
            )));
        }

        if let Some(mut entry) = self.channels.get_mut(channel) {
            entry.subscribers.remove(socket_id);
            debug!(
                channel = %channel,
                socket = %socket_id,
                subscribers = entry.subscribers.len(),
                "Unsubscribed"
            );
        }
        self.drop_if_empty(channel);

        Ok(())
    }

    async fn publish(&self, channel: &str, data: Option<Value>) -> Result<usize, BrokerError> {
        validate_channel_name(channel).map_err(BrokerError::new)?;

        if let Some(entry) = self.channels.get(channel) {
            let message = Arc::new(ChannelMessage {
                channel: channel.to_string(),
                data,
            });
            let count = entry.sender.send(message).unwrap_or_default();
            trace!(channel = %channel, recipients = count, "Published message");
            Ok(count)
        } else {
            warn!(channel = %channel, "Publish to non-existent channel");
            Ok(0)
        }
    }

    fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    fn channel_exists(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribe_requires_bind() {
        let broker = MemoryBroker::new();
        assert!(broker.subscribe("socket-1", "room").await.is_err());

        broker.bind("socket-1").await.unwrap();
        assert!(broker.subscribe("socket-1", "room").await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_fans_out() {
        let broker = MemoryBroker::new();
        broker.bind("a").await.unwrap();
        broker.bind("b").await.unwrap();

        let mut rx_a = broker.subscribe("a", "room").await.unwrap();
        let mut rx_b = broker.subscribe("b", "room").await.unwrap();

        let count = broker.publish("room", Some(json!("hello"))).await.unwrap();
        assert_eq!(count, 2);

        assert_eq!(rx_a.try_recv().unwrap().data, Some(json!("hello")));
        assert_eq!(rx_b.try_recv().unwrap().data, Some(json!("hello")));
    }

    #[tokio::test]
    async fn test_publish_without_channel_reaches_nobody() {
        let broker = MemoryBroker::new();
        let count = broker.publish("nowhere", Some(json!(1))).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_deletes_empty_channel() {
        let broker = MemoryBroker::new();
        broker.bind("a").await.unwrap();

        let _rx = broker.subscribe("a", "room").await.unwrap();
        assert!(broker.channel_exists("room"));
        assert_eq!(broker.subscriber_count("room"), 1);

        broker.unsubscribe("a", "room").await.unwrap();
        assert!(!broker.channel_exists("room"));
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_fails() {
        let broker = MemoryBroker::new();
        broker.bind("a").await.unwrap();
        assert!(broker.unsubscribe("a", "room").await.is_err());
    }

    #[tokio::test]
    async fn test_double_subscribe_fails() {
        let broker = MemoryBroker::new();
        broker.bind("a").await.unwrap();

        let _rx = broker.subscribe("a", "room").await.unwrap();
        assert!(broker.subscribe("a", "room").await.is_err());
    }

    #[tokio::test]
    async fn test_unbind_drains_subscriptions() {
        let broker = MemoryBroker::new();
        broker.bind("a").await.unwrap();

        let _rx1 = broker.subscribe("a", "room-1").await.unwrap();
        let _rx2 = broker.subscribe("a", "room-2").await.unwrap();

        broker.unbind("a").await.unwrap();
        assert!(!broker.channel_exists("room-1"));
        assert!(!broker.channel_exists("room-2"));
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_channel_names() {
        let broker = MemoryBroker::new();
        broker.bind("a").await.unwrap();

        assert!(broker.subscribe("a", "").await.is_err());
        let long = "x".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(broker.subscribe("a", &long).await.is_err());
        assert!(broker.subscribe("a", "bad\nname").await.is_err());
    }

    #[tokio::test]
    async fn test_exchange_publishes_through_broker() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        broker.bind("a").await.unwrap();
        let mut rx = broker.subscribe("a", "room").await.unwrap();

        let exchange = Exchange::new(Arc::clone(&broker));
        let count = exchange.publish("room", Some(json!(1))).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(rx.try_recv().unwrap().channel, "room");
    }
}
