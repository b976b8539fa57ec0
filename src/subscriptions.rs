//! Subscription storage port and pub/sub plumbing
//!
//! A subscription maps a topic to the set of subscriber queue addresses.
//! Storage is either *centralized* (one shared store that every endpoint
//! mutates directly) or *local* (each publisher owns the subscriptions to
//! its topics, and subscribers ask for changes with the
//! [`SubscribeRequest`]/[`UnsubscribeRequest`] commands below).
//!
//! Both request commands are idempotent: registering twice or unregistering
//! an absent subscriber leaves storage unchanged.

use crate::dispatch::{Handler, MessageContext};
use crate::domain_types::{QueueAddress, TopicName};
use crate::errors::BusResult;
use crate::serializer::BusMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Port mapping topics to subscriber addresses
#[async_trait]
pub trait SubscriptionStorage: Send + Sync {
    /// Addresses subscribed to the topic
    async fn subscribers(&self, topic: &TopicName) -> BusResult<Vec<QueueAddress>>;

    /// Adds a subscriber; idempotent
    async fn register(&self, topic: &TopicName, subscriber: &QueueAddress) -> BusResult<()>;

    /// Removes a subscriber; idempotent
    async fn unregister(&self, topic: &TopicName, subscriber: &QueueAddress) -> BusResult<()>;

    /// True when the store is shared between endpoints, letting a
    /// subscriber mutate it directly instead of asking the publisher
    fn is_centralized(&self) -> bool;
}

/// In-memory subscription storage.
///
/// Clones share the underlying map, so a centralized store can be handed
/// to several buses in one process.
#[derive(Debug, Clone)]
pub struct InMemSubscriptionStorage {
    topics: Arc<DashMap<TopicName, HashSet<QueueAddress>>>,
    centralized: bool,
}

impl InMemSubscriptionStorage {
    /// A store owned by a single endpoint (publisher-side)
    pub fn local() -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            centralized: false,
        }
    }

    /// A store meant to be shared: clone it into every participating bus
    pub fn centralized() -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            centralized: true,
        }
    }

    /// Number of topics with at least one subscriber
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// True when the topic has the given subscriber
    pub fn is_subscribed(&self, topic: &TopicName, subscriber: &QueueAddress) -> bool {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.contains(subscriber))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SubscriptionStorage for InMemSubscriptionStorage {
    async fn subscribers(&self, topic: &TopicName) -> BusResult<Vec<QueueAddress>> {
        Ok(self
            .topics
            .get(topic)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn register(&self, topic: &TopicName, subscriber: &QueueAddress) -> BusResult<()> {
        self.topics
            .entry(topic.clone())
            .or_default()
            .insert(subscriber.clone());
        Ok(())
    }

    async fn unregister(&self, topic: &TopicName, subscriber: &QueueAddress) -> BusResult<()> {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(subscriber);
        }
        Ok(())
    }

    fn is_centralized(&self) -> bool {
        self.centralized
    }
}

/// Command asking a publisher to add a subscriber to a topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Topic being subscribed to
    pub topic: TopicName,
    /// Input queue of the subscriber
    pub subscriber_address: QueueAddress,
}

impl BusMessage for SubscribeRequest {
    fn message_type() -> &'static str {
        "omnibus.subscribe-request"
    }
}

/// Command asking a publisher to remove a subscriber from a topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    /// Topic being unsubscribed from
    pub topic: TopicName,
    /// Input queue of the subscriber
    pub subscriber_address: QueueAddress,
}

impl BusMessage for UnsubscribeRequest {
    fn message_type() -> &'static str {
        "omnibus.unsubscribe-request"
    }
}

/// Built-in handler mutating local storage on behalf of remote subscribers
pub(crate) struct SubscriptionRequestHandler {
    storage: Arc<dyn SubscriptionStorage>,
}

impl SubscriptionRequestHandler {
    pub(crate) fn new(storage: Arc<dyn SubscriptionStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Handler<SubscribeRequest> for SubscriptionRequestHandler {
    async fn handle(&self, message: &SubscribeRequest, _ctx: &MessageContext) -> anyhow::Result<()> {
        debug!(topic = %message.topic, subscriber = %message.subscriber_address, "registering subscriber");
        self.storage
            .register(&message.topic, &message.subscriber_address)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Handler<UnsubscribeRequest> for SubscriptionRequestHandler {
    async fn handle(
        &self,
        message: &UnsubscribeRequest,
        _ctx: &MessageContext,
    ) -> anyhow::Result<()> {
        debug!(topic = %message.topic, subscriber = %message.subscriber_address, "unregistering subscriber");
        self.storage
            .unregister(&message.topic, &message.subscriber_address)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> TopicName {
        TopicName::try_new(name.to_string()).unwrap()
    }

    fn addr(name: &str) -> QueueAddress {
        QueueAddress::try_new(name.to_string()).unwrap()
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let storage = InMemSubscriptionStorage::local();
        let t = topic("orders.placed");
        let a = addr("billing");

        storage.register(&t, &a).await.unwrap();
        storage.register(&t, &a).await.unwrap();

        assert_eq!(storage.subscribers(&t).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_restores_state() {
        let storage = InMemSubscriptionStorage::local();
        let t = topic("orders.placed");
        let a = addr("billing");

        storage.register(&t, &a).await.unwrap();
        storage.unregister(&t, &a).await.unwrap();

        assert!(storage.subscribers(&t).await.unwrap().is_empty());
        // Unregistering again is fine
        storage.unregister(&t, &a).await.unwrap();
    }

    #[tokio::test]
    async fn clones_share_the_centralized_store() {
        let storage = InMemSubscriptionStorage::centralized();
        let clone = storage.clone();
        let t = topic("orders.placed");
        let a = addr("billing");

        storage.register(&t, &a).await.unwrap();

        assert!(clone.is_centralized());
        assert!(clone.is_subscribed(&t, &a));
    }
}
