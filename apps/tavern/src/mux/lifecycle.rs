use std::sync::Arc;

use chrono::Utc;
use portal_proto::BytesPayloadKind;
use portal_stream::Sequencer;
use tracing::{info, warn};

use super::{topic_in, topic_out, Mux, MuxError, SubscriptionLease};
use crate::store::{PortalRecord, PortalStore};

/// Stream carrying the CLOSE notice sent to operators when a Portal closes.
pub const PORTAL_CLOSE_STREAM_ID: &str = "tavern-portal";

impl Mux {
    /// Agent side: open a new Portal for `task_id`.
    ///
    /// Creates the Portal record, makes sure both topics exist and subscribes
    /// this replica to the ingress topic. The returned teardown closes the
    /// Portal.
    pub async fn create_portal(
        &self,
        store: Arc<dyn PortalStore>,
        task_id: i64,
    ) -> Result<(PortalRecord, PortalTeardown), MuxError> {
        let task = store.load_task(task_id).await?;
        let portal = store.create_portal(&task).await?;
        let ingress = topic_in(portal.id);
        let egress = topic_out(portal.id);

        let lease = async {
            self.ensure_topic(&ingress).await?;
            self.ensure_topic(&egress).await?;
            self.acquire_subscription(&ingress).await
        }
        .await;
        let lease = match lease {
            Ok(lease) => lease,
            Err(err) => {
                if let Err(close_err) = store.close_portal(portal.id, Utc::now()).await {
                    warn!(
                        portal_id = portal.id,
                        error = %close_err,
                        "failed to close portal after setup error"
                    );
                }
                return Err(err);
            }
        };

        info!(
            portal_id = portal.id,
            task_id,
            beacon_id = portal.beacon_id,
            "portal created"
        );
        let teardown = PortalTeardown {
            portal_id: portal.id,
            lease,
            store,
            mux: self.clone(),
            closed: false,
        };
        Ok((portal, teardown))
    }

    /// Operator side: attach to an existing, open Portal. The lease only
    /// holds the egress subscription; releasing it leaves the Portal open.
    pub async fn open_portal(
        &self,
        store: &dyn PortalStore,
        portal_id: i64,
    ) -> Result<SubscriptionLease, MuxError> {
        let portal = store.load_portal(portal_id).await?;
        if portal.is_closed() {
            return Err(MuxError::PortalClosed(portal_id));
        }
        self.acquire_subscription(&topic_out(portal_id)).await
    }
}

/// Closes a Portal opened by [`Mux::create_portal`]: releases the ingress
/// subscription, tells attached operators with a CLOSE mote on the egress
/// topic, stamps `closed_at` and forgets both topics' history.
/// Dropping it without calling [`PortalTeardown::close`] closes the Portal
/// from a background task.
pub struct PortalTeardown {
    portal_id: i64,
    lease: SubscriptionLease,
    store: Arc<dyn PortalStore>,
    mux: Mux,
    closed: bool,
}

impl PortalTeardown {
    pub fn portal_id(&self) -> i64 {
        self.portal_id
    }

    pub async fn close(mut self) {
        self.closed = true;
        self.lease.release();
        mark_closed(self.portal_id, Arc::clone(&self.store), self.mux.clone()).await;
    }
}

async fn mark_closed(portal_id: i64, store: Arc<dyn PortalStore>, mux: Mux) {
    let notice = Sequencer::new(PORTAL_CLOSE_STREAM_ID)
        .new_bytes_mote(Vec::new(), BytesPayloadKind::Close);
    if let Err(err) = mux.publish(&topic_out(portal_id), notice).await {
        warn!(portal_id, error = %err, "failed to publish portal close notice");
    }
    if let Err(err) = store.close_portal(portal_id, Utc::now()).await {
        warn!(portal_id, error = %err, "failed to mark portal closed");
    }
    mux.dispatcher.forget_history(&topic_in(portal_id));
    mux.dispatcher.forget_history(&topic_out(portal_id));
    info!(portal_id, "portal closed");
}

impl Drop for PortalTeardown {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.lease.release();
        let task = mark_closed(self.portal_id, Arc::clone(&self.store), self.mux.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => warn!(
                portal_id = self.portal_id,
                "portal teardown dropped outside a runtime"
            ),
        }
    }
}
