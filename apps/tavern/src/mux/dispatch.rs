use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portal_proto::{decode_mote, Mote};
use portal_pubsub::Message;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

use super::history::HistoryStore;
use super::SENDER_ID_ATTRIBUTE;
use crate::metrics;

const DROP_LOG_EVERY: u64 = 1000;

struct LocalSubscriber {
    id: u64,
    tx: mpsc::Sender<Mote>,
}

/// Local fan-out shared by the publish path and every backplane receive loop.
pub(crate) struct Dispatcher {
    server_id: String,
    window: Duration,
    history: HistoryStore,
    subscribers: Mutex<HashMap<String, Vec<LocalSubscriber>>>,
    next_subscriber: AtomicU64,
    dropped: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new(server_id: String, window: Duration, history: HistoryStore) -> Self {
        Self {
            server_id,
            window,
            history,
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn server_id(&self) -> &str {
        &self.server_id
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Append to history and hand `mote` to every local subscriber of `topic`.
    ///
    /// The history append and the subscriber snapshot happen under the
    /// registry lock, so a concurrent `subscribe` sees the mote either in its
    /// replay or in live delivery, never both.
    pub(crate) async fn dispatch(&self, topic: &str, mote: Mote) {
        let targets: Vec<mpsc::Sender<Mote>> = {
            let subscribers = self.subscribers.lock();
            self.history.append(topic, mote.clone());
            subscribers
                .get(topic)
                .map(|subs| subs.iter().map(|sub| sub.tx.clone()).collect())
                .unwrap_or_default()
        };
        for tx in targets {
            self.deliver(topic, &tx, mote.clone()).await;
        }
    }

    async fn deliver(&self, topic: &str, tx: &mpsc::Sender<Mote>, mote: Mote) {
        let mote = match tx.try_send(mote) {
            Ok(()) | Err(TrySendError::Closed(_)) => return,
            Err(TrySendError::Full(mote)) => mote,
        };
        if tokio::time::timeout(self.window, tx.send(mote)).await.is_err() {
            self.record_drop(topic);
        }
    }

    fn record_drop(&self, topic: &str) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::MUX_DROPPED
            .with_label_values(&[metrics::direction(topic)])
            .inc();
        if total == 1 || total % DROP_LOG_EVERY == 0 {
            warn!(
                topic,
                dropped_total = total,
                window_ms = self.window.as_millis() as u64,
                "subscriber too slow, dropping mote"
            );
        }
    }

    /// Handle a message pulled off the backplane.
    pub(crate) async fn ingest(&self, topic: &str, message: Message) {
        if message.attribute(SENDER_ID_ATTRIBUTE) == Some(self.server_id.as_str()) {
            trace!(topic, "skipping loopback message");
            return;
        }
        let mote = match decode_mote(&message.data) {
            Ok(mote) => mote,
            Err(err) => {
                warn!(topic, error = %err, "discarding undecodable backplane message");
                return;
            }
        };
        metrics::MUX_RECEIVED
            .with_label_values(&[metrics::direction(topic)])
            .inc();
        self.dispatch(topic, mote).await;
    }

    /// Register a subscriber after replaying the topic's history into it.
    /// Replay stops early once the channel is full.
    pub(crate) fn subscribe(&self, topic: &str, capacity: usize) -> (mpsc::Receiver<Mote>, u64) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock();
        for mote in self.history.snapshot(topic) {
            if tx.try_send(mote).is_err() {
                break;
            }
        }
        subscribers
            .entry(topic.to_string())
            .or_default()
            .push(LocalSubscriber { id, tx });
        (rx, id)
    }

    pub(crate) fn unsubscribe(&self, topic: &str, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(subs) = subscribers.get_mut(topic) {
            subs.retain(|sub| sub.id != id);
            if subs.is_empty() {
                subscribers.remove(topic);
            }
        }
    }

    pub(crate) fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub(crate) fn forget_history(&self, topic: &str) {
        self.history.forget(topic);
    }
}

/// Handle returned by [`super::Mux::subscribe`]. Cancelling (or dropping) it
/// unregisters the subscriber, which closes its channel.
pub struct LocalSubscription {
    dispatcher: Arc<Dispatcher>,
    topic: String,
    id: u64,
    cancelled: bool,
}

impl LocalSubscription {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, topic: String, id: u64) -> Self {
        Self {
            dispatcher,
            topic,
            id,
            cancelled: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.dispatcher.unsubscribe(&self.topic, self.id);
        }
    }
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
