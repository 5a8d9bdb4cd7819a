use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portal_pubsub::{Driver, Subscription};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::dispatch::Dispatcher;

const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

struct ActiveSubscription {
    refs: usize,
    cancel: CancellationToken,
}

/// Refcounts backplane subscriptions by name so every local holder of a
/// topic shares one driver handle and one receive loop.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    active: Mutex<HashMap<String, ActiveSubscription>>,
}

impl SubscriptionTable {
    /// Take another reference on `name` if it is already live.
    pub(crate) fn retain(&self, name: &str) -> bool {
        match self.active.lock().get_mut(name) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Install `subscription` under `name` and start its receive loop, or, if
    /// another caller got there first, take a reference on theirs and drop
    /// this handle.
    pub(crate) fn install(
        &self,
        name: &str,
        topic: &str,
        subscription: Box<dyn Subscription>,
        dispatcher: Arc<Dispatcher>,
        driver: Arc<dyn Driver>,
    ) {
        let mut active = self.active.lock();
        if let Some(entry) = active.get_mut(name) {
            entry.refs += 1;
            return;
        }
        let cancel = CancellationToken::new();
        tokio::spawn(receive_loop(
            topic.to_string(),
            subscription,
            dispatcher,
            driver,
            cancel.clone(),
        ));
        active.insert(name.to_string(), ActiveSubscription { refs: 1, cancel });
    }

    fn release(&self, name: &str) {
        let mut active = self.active.lock();
        let Some(entry) = active.get_mut(name) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = active.remove(name) {
                debug!(subscription = name, "last holder released, stopping receive loop");
                entry.cancel.cancel();
            }
        }
    }

    pub(crate) fn refs(&self, name: &str) -> usize {
        self.active
            .lock()
            .get(name)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }
}

/// One reference on a backplane subscription. Releasing is idempotent;
/// dropping an unreleased lease releases it.
pub struct SubscriptionLease {
    table: Arc<SubscriptionTable>,
    name: String,
    released: AtomicBool,
}

impl SubscriptionLease {
    pub(crate) fn new(table: Arc<SubscriptionTable>, name: String) -> Self {
        Self {
            table,
            name,
            released: AtomicBool::new(false),
        }
    }

    pub fn subscription_name(&self) -> &str {
        &self.name
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.table.release(&self.name);
        }
    }
}

impl Drop for SubscriptionLease {
    fn drop(&mut self) {
        self.release();
    }
}

async fn receive_loop(
    topic: String,
    mut subscription: Box<dyn Subscription>,
    dispatcher: Arc<Dispatcher>,
    driver: Arc<dyn Driver>,
    cancel: CancellationToken,
) {
    debug!(topic = %topic, subscription = subscription.name(), "backplane receive loop started");
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = subscription.receive() => received,
        };
        match received {
            Ok(received) => {
                if let Err(err) = subscription.ack(&received.ack_id).await {
                    warn!(topic = %topic, error = %err, "backplane ack failed");
                }
                dispatcher.ingest(&topic, received.message).await;
            }
            Err(err) => {
                warn!(topic = %topic, error = %err, "backplane receive failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => {}
                }
            }
        }
    }
    let name = subscription.name().to_string();
    drop(subscription);
    debug!(topic = %topic, subscription = %name, "backplane receive loop stopped");
    if let Err(err) = driver.delete_subscription(&name).await {
        debug!(subscription = %name, error = %err, "failed to delete released subscription");
    }
}
