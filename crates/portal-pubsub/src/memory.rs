use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Driver, Message, PubSubError, PubSubResult, ReceivedMessage, Subscription};

type SharedQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>;

struct QueueState {
    topic: String,
    tx: mpsc::UnboundedSender<Message>,
    rx: SharedQueue,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, HashSet<String>>,
    subscriptions: HashMap<String, QueueState>,
    closed: bool,
}

/// Process-local backplane with Pub/Sub delivery semantics: every
/// subscription on a topic gets its own copy, handles on one subscription
/// share its queue, and messages published before a subscription exists are
/// not delivered to it.
#[derive(Default)]
pub struct InMemoryDriver {
    state: Mutex<State>,
    next_ack: Arc<AtomicU64>,
}

impl InMemoryDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live handles on `subscription`.
    pub fn live_handles(&self, subscription: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(subscription)
            .map(|queue| Arc::strong_count(&queue.rx) - 1)
            .unwrap_or(0)
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.state.lock().topics.contains_key(topic)
    }

    pub fn has_subscription(&self, subscription: &str) -> bool {
        self.state.lock().subscriptions.contains_key(subscription)
    }
}

#[async_trait]
impl Driver for InMemoryDriver {
    async fn ensure_topic(&self, topic: &str) -> PubSubResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PubSubError::Closed);
        }
        state.topics.entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn ensure_subscription(
        &self,
        topic: &str,
        subscription: &str,
        _ttl: Duration,
    ) -> PubSubResult<Box<dyn Subscription>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PubSubError::Closed);
        }
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(subscription.to_string());
        let queue = state
            .subscriptions
            .entry(subscription.to_string())
            .or_insert_with(|| {
                debug!(topic, subscription, "creating in-memory subscription");
                let (tx, rx) = mpsc::unbounded_channel();
                QueueState {
                    topic: topic.to_string(),
                    tx,
                    rx: Arc::new(tokio::sync::Mutex::new(rx)),
                }
            });
        if queue.topic != topic {
            return Err(PubSubError::Api {
                status: 409,
                body: format!(
                    "subscription {subscription} is attached to topic {}",
                    queue.topic
                ),
            });
        }
        Ok(Box::new(MemorySubscription {
            name: subscription.to_string(),
            queue: Arc::clone(&queue.rx),
            next_ack: Arc::clone(&self.next_ack),
        }))
    }

    async fn publish(&self, topic: &str, message: Message) -> PubSubResult<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(PubSubError::Closed);
        }
        let subscriptions = state
            .topics
            .get(topic)
            .ok_or_else(|| PubSubError::TopicNotFound(topic.to_string()))?;
        for name in subscriptions {
            if let Some(queue) = state.subscriptions.get(name) {
                let _ = queue.tx.send(message.clone());
            }
        }
        Ok(())
    }

    /// Removes the queue only once no handle on it is left, so a holder that
    /// raced the deletion keeps receiving.
    async fn delete_subscription(&self, subscription: &str) -> PubSubResult<()> {
        let mut state = self.state.lock();
        let Some(queue) = state.subscriptions.get(subscription) else {
            return Ok(());
        };
        if Arc::strong_count(&queue.rx) > 1 {
            debug!(subscription, "subscription still held, keeping it");
            return Ok(());
        }
        let topic = queue.topic.clone();
        state.subscriptions.remove(subscription);
        if let Some(names) = state.topics.get_mut(&topic) {
            names.remove(subscription);
        }
        debug!(topic = %topic, subscription, "deleted in-memory subscription");
        Ok(())
    }

    async fn close(&self) -> PubSubResult<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscriptions.clear();
        state.topics.clear();
        Ok(())
    }
}

struct MemorySubscription {
    name: String,
    queue: SharedQueue,
    next_ack: Arc<AtomicU64>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&mut self) -> PubSubResult<ReceivedMessage> {
        let message = self
            .queue
            .lock()
            .await
            .recv()
            .await
            .ok_or(PubSubError::Closed)?;
        let ack_id = self.next_ack.fetch_add(1, Ordering::Relaxed).to_string();
        Ok(ReceivedMessage { ack_id, message })
    }

    async fn ack(&mut self, _ack_id: &str) -> PubSubResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_SUBSCRIPTION_TTL;

    #[tokio::test]
    async fn each_subscription_gets_a_copy() {
        let driver = InMemoryDriver::new();
        driver.ensure_topic("PORTAL_IN_7").await.unwrap();
        let mut a = driver
            .ensure_subscription("PORTAL_IN_7", "PORTAL_IN_7_SUB_a", DEFAULT_SUBSCRIPTION_TTL)
            .await
            .unwrap();
        let mut b = driver
            .ensure_subscription("PORTAL_IN_7", "PORTAL_IN_7_SUB_b", DEFAULT_SUBSCRIPTION_TTL)
            .await
            .unwrap();

        driver
            .publish("PORTAL_IN_7", Message::new("hello").with_attribute("sender_id", "x"))
            .await
            .unwrap();

        let got_a = a.receive().await.unwrap();
        let got_b = b.receive().await.unwrap();
        assert_eq!(got_a.message.data, "hello");
        assert_eq!(got_b.message.attribute("sender_id"), Some("x"));
        assert_ne!(got_a.ack_id, got_b.ack_id);
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_fails() {
        let driver = InMemoryDriver::new();
        let err = driver
            .publish("PORTAL_OUT_1", Message::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::TopicNotFound(t) if t == "PORTAL_OUT_1"));
    }

    #[tokio::test]
    async fn handles_are_counted_and_released() {
        let driver = InMemoryDriver::new();
        let first = driver
            .ensure_subscription("T", "T_SUB_1", DEFAULT_SUBSCRIPTION_TTL)
            .await
            .unwrap();
        let second = driver
            .ensure_subscription("T", "T_SUB_1", DEFAULT_SUBSCRIPTION_TTL)
            .await
            .unwrap();
        assert_eq!(driver.live_handles("T_SUB_1"), 2);
        drop(first);
        assert_eq!(driver.live_handles("T_SUB_1"), 1);
        drop(second);
        assert_eq!(driver.live_handles("T_SUB_1"), 0);
        assert!(driver.has_topic("T"));
    }

    #[tokio::test]
    async fn deleted_subscription_stops_buffering() {
        let driver = InMemoryDriver::new();
        let held = driver
            .ensure_subscription("T", "T_SUB_1", DEFAULT_SUBSCRIPTION_TTL)
            .await
            .unwrap();
        driver.delete_subscription("T_SUB_1").await.unwrap();
        assert!(driver.has_subscription("T_SUB_1"));

        drop(held);
        driver.delete_subscription("T_SUB_1").await.unwrap();
        assert!(!driver.has_subscription("T_SUB_1"));
        assert!(driver.has_topic("T"));

        for i in 0..100 {
            driver
                .publish("T", Message::new(vec![0u8; 1024]).with_attribute("n", i.to_string()))
                .await
                .unwrap();
        }
        let mut fresh = driver
            .ensure_subscription("T", "T_SUB_1", DEFAULT_SUBSCRIPTION_TTL)
            .await
            .unwrap();
        driver.publish("T", Message::new("after")).await.unwrap();
        assert_eq!(fresh.receive().await.unwrap().message.data, "after");
    }

    #[tokio::test]
    async fn close_ends_receivers() {
        let driver = InMemoryDriver::new();
        let mut sub = driver
            .ensure_subscription("T", "T_SUB_1", DEFAULT_SUBSCRIPTION_TTL)
            .await
            .unwrap();
        driver.close().await.unwrap();
        assert!(matches!(sub.receive().await, Err(PubSubError::Closed)));
        assert!(matches!(
            driver.ensure_topic("T").await,
            Err(PubSubError::Closed)
        ));
    }
}
