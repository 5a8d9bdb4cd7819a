//! Portal multiplexer.
//!
//! Every Portal maps to two backplane topics: `PORTAL_IN_<id>` carries
//! operator traffic towards the agent and `PORTAL_OUT_<id>` carries agent
//! traffic back. A publish is delivered to local subscribers first and then
//! to the backplane so other replicas can pick it up; each replica drops the
//! copies it published itself.

mod dispatch;
mod history;
mod lifecycle;
mod subscriptions;

use std::sync::Arc;
use std::time::Duration;

use portal_proto::{encode_mote, CodecError, Mote};
use portal_pubsub::{Driver, Message, PubSubError, DEFAULT_SUBSCRIPTION_TTL};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metrics;
use crate::store::StoreError;

pub use dispatch::LocalSubscription;
pub use history::HistoryBuffer;
pub use lifecycle::{PortalTeardown, PORTAL_CLOSE_STREAM_ID};
pub use subscriptions::SubscriptionLease;

use dispatch::Dispatcher;
use history::HistoryStore;
use subscriptions::SubscriptionTable;

pub const DEFAULT_HISTORY_SIZE: usize = 1024;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 15_625;
pub const DEFAULT_DISPATCH_WINDOW: Duration = Duration::from_millis(100);
pub const MIN_DISPATCH_WINDOW: Duration = Duration::from_millis(50);
pub const MAX_DISPATCH_WINDOW: Duration = Duration::from_millis(250);
/// Backplane attribute naming the replica that published a message.
pub const SENDER_ID_ATTRIBUTE: &str = "sender_id";

pub fn topic_in(portal_id: i64) -> String {
    format!("PORTAL_IN_{portal_id}")
}

pub fn topic_out(portal_id: i64) -> String {
    format!("PORTAL_OUT_{portal_id}")
}

pub fn subscription_name(topic: &str, server_id: &str) -> String {
    format!("{topic}_SUB_{server_id}")
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("portal {0} is closed")]
    PortalClosed(i64),
    #[error("portal store error: {0}")]
    Store(String),
    #[error("backplane error: {0}")]
    PubSub(#[from] PubSubError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<StoreError> for MuxError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TaskNotFound(id) => MuxError::NotFound(format!("task {id}")),
            StoreError::PortalNotFound(id) => MuxError::NotFound(format!("portal {id}")),
            StoreError::Backend(msg) => MuxError::Store(msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Identifies this replica on the backplane; random per process.
    pub server_id: String,
    pub history_size: usize,
    pub history_bytes: Option<usize>,
    pub subscriber_buffer: usize,
    pub dispatch_window: Duration,
    pub subscription_ttl: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            server_id: uuid::Uuid::new_v4().to_string(),
            history_size: DEFAULT_HISTORY_SIZE,
            history_bytes: None,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            dispatch_window: DEFAULT_DISPATCH_WINDOW,
            subscription_ttl: DEFAULT_SUBSCRIPTION_TTL,
        }
    }
}

#[derive(Clone)]
pub struct Mux {
    driver: Arc<dyn Driver>,
    dispatcher: Arc<Dispatcher>,
    subscriptions: Arc<SubscriptionTable>,
    subscriber_buffer: usize,
    subscription_ttl: Duration,
}

impl Mux {
    pub fn new(driver: Arc<dyn Driver>, config: MuxConfig) -> Self {
        let window = config
            .dispatch_window
            .clamp(MIN_DISPATCH_WINDOW, MAX_DISPATCH_WINDOW);
        if window != config.dispatch_window {
            warn!(
                requested_ms = config.dispatch_window.as_millis() as u64,
                effective_ms = window.as_millis() as u64,
                "dispatch window out of range, clamping"
            );
        }
        let history = HistoryStore::new(config.history_size, config.history_bytes);
        Self {
            driver,
            dispatcher: Arc::new(Dispatcher::new(config.server_id, window, history)),
            subscriptions: Arc::new(SubscriptionTable::default()),
            subscriber_buffer: config.subscriber_buffer.max(1),
            subscription_ttl: config.subscription_ttl,
        }
    }

    pub fn server_id(&self) -> &str {
        self.dispatcher.server_id()
    }

    /// Motes dropped so far because a local subscriber stayed full.
    pub fn dropped_count(&self) -> u64 {
        self.dispatcher.dropped()
    }

    pub async fn ensure_topic(&self, topic: &str) -> Result<(), MuxError> {
        Ok(self.driver.ensure_topic(topic).await?)
    }

    /// Deliver locally, then publish to the backplane. A backplane failure is
    /// returned but local subscribers have already been served.
    pub async fn publish(&self, topic: &str, mote: Mote) -> Result<(), MuxError> {
        let frame = encode_mote(&mote)?;
        self.dispatcher.dispatch(topic, mote).await;

        let message = Message::new(frame).with_attribute(SENDER_ID_ATTRIBUTE, self.server_id());
        let direction = metrics::direction(topic);
        match self.driver.publish(topic, message).await {
            Ok(()) => {
                metrics::MUX_PUBLISHED
                    .with_label_values(&[direction, "ok"])
                    .inc();
                Ok(())
            }
            Err(err) => {
                metrics::MUX_PUBLISHED
                    .with_label_values(&[direction, "error"])
                    .inc();
                Err(err.into())
            }
        }
    }

    /// Local channel subscription. History for `topic` is replayed first.
    pub fn subscribe(&self, topic: &str) -> (mpsc::Receiver<Mote>, LocalSubscription) {
        let (rx, id) = self.dispatcher.subscribe(topic, self.subscriber_buffer);
        debug!(topic, subscriber = id, "local subscriber registered");
        (
            rx,
            LocalSubscription::new(Arc::clone(&self.dispatcher), topic.to_string(), id),
        )
    }

    /// Take a reference on this replica's backplane subscription for `topic`,
    /// creating it and starting its receive loop on first use.
    pub async fn acquire_subscription(&self, topic: &str) -> Result<SubscriptionLease, MuxError> {
        let name = subscription_name(topic, self.server_id());
        if !self.subscriptions.retain(&name) {
            let handle = self
                .driver
                .ensure_subscription(topic, &name, self.subscription_ttl)
                .await?;
            self.subscriptions.install(
                &name,
                topic,
                handle,
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.driver),
            );
        }
        Ok(SubscriptionLease::new(Arc::clone(&self.subscriptions), name))
    }

    /// Holders of this replica's backplane subscription for `topic`.
    pub fn subscription_refs(&self, topic: &str) -> usize {
        self.subscriptions
            .refs(&subscription_name(topic, self.server_id()))
    }

    pub fn local_subscribers(&self, topic: &str) -> usize {
        self.dispatcher.subscriber_count(topic)
    }

    pub async fn close(&self) {
        if let Err(err) = self.driver.close().await {
            warn!(error = %err, "closing backplane driver failed");
        }
    }
}
