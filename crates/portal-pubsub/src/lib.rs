//! Pub/sub backplane used to fan Portal traffic across server replicas.
//!
//! The [`Driver`] trait is the only surface the Mux sees. Two drivers ship:
//! [`InMemoryDriver`] for single-process deployments and tests, and
//! [`GcpDriver`] which speaks the Google Cloud Pub/Sub REST API.

mod gcp;
mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use gcp::{GcpConfig, GcpDriver, TokenSource};
pub use memory::InMemoryDriver;

pub const DEFAULT_SUBSCRIPTION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("topic {0} not found")]
    TopicNotFound(String),
    #[error("subscription {0} not found")]
    SubscriptionNotFound(String),
    #[error("pubsub driver closed")]
    Closed,
    #[error("pubsub http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("pubsub api error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("pubsub auth error: {0}")]
    Auth(String),
    #[error("pubsub decode error: {0}")]
    Decode(String),
}

pub type PubSubResult<T> = Result<T, PubSubError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub data: Bytes,
    pub attributes: HashMap<String, String>,
}

impl Message {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: Message,
}

/// A live handle on a named subscription. Handles on the same name compete
/// for messages; the Mux keeps exactly one per name.
#[async_trait]
pub trait Subscription: Send {
    fn name(&self) -> &str;
    /// Wait for the next message.
    async fn receive(&mut self) -> PubSubResult<ReceivedMessage>;
    /// Acknowledge a received message. Drivers that acknowledge on receipt
    /// treat this as a no-op.
    async fn ack(&mut self, ack_id: &str) -> PubSubResult<()>;
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Create the topic if it does not exist yet.
    async fn ensure_topic(&self, topic: &str) -> PubSubResult<()>;
    /// Create the subscription if needed and return a handle on it.
    /// Backends that support it expire the subscription after `ttl` of inactivity.
    async fn ensure_subscription(
        &self,
        topic: &str,
        subscription: &str,
        ttl: Duration,
    ) -> PubSubResult<Box<dyn Subscription>>;
    async fn publish(&self, topic: &str, message: Message) -> PubSubResult<()>;
    /// Drop a subscription nobody in this process reads any more. Backends
    /// whose subscriptions expire on their own may leave it in place.
    async fn delete_subscription(&self, _subscription: &str) -> PubSubResult<()> {
        Ok(())
    }
    async fn close(&self) -> PubSubResult<()> {
        Ok(())
    }
}
