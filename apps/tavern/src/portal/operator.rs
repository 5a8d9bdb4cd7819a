use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use portal_proto::trace::TraceEventKind;
use portal_proto::{BytesPayloadKind, Mote, OpenPortalRequest, OpenPortalResponse};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status, Streaming};
use tracing::{debug, info, warn};

use super::{stamp, PortalService, RESPONSE_BUFFER};
use crate::metrics;
use crate::mux::{topic_in, topic_out, LocalSubscription, Mux, SubscriptionLease};
use crate::store::PortalStore;

/// Optional metadata naming the operator user, used for active-user
/// heartbeats.
pub const USER_METADATA_KEY: &str = "x-tavern-user";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

type Outbound = mpsc::Sender<Result<OpenPortalResponse, Status>>;

/// Register an operator stream and spawn its session.
pub(super) async fn start(
    service: &PortalService,
    user_id: Option<i64>,
    mut inbound: Streaming<OpenPortalRequest>,
) -> Result<ReceiverStream<Result<OpenPortalResponse, Status>>, Status> {
    let registration = inbound
        .message()
        .await?
        .ok_or_else(|| Status::invalid_argument("missing portal registration"))?;
    let portal_id = registration.portal_id;
    if portal_id <= 0 {
        return Err(Status::invalid_argument("portal_id is required"));
    }

    let lease = service
        .mux
        .open_portal(service.store.as_ref(), portal_id)
        .await?;
    let (motes, local) = service.mux.subscribe(&topic_out(portal_id));
    let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);

    metrics::PORTAL_SESSIONS
        .with_label_values(&["operator"])
        .inc();
    info!(portal_id, user_id, "operator attached");

    let session = OperatorSession {
        mux: service.mux.clone(),
        portal_id,
        cancel: CancellationToken::new(),
    };
    if let Some(user_id) = user_id {
        tokio::spawn(heartbeat(
            Arc::clone(&service.store),
            portal_id,
            user_id,
            session.cancel.clone(),
        ));
    }
    tokio::spawn(session.run(inbound, registration.mote, motes, local, lease, tx));
    Ok(ReceiverStream::new(rx))
}

struct OperatorSession {
    mux: Mux,
    portal_id: i64,
    cancel: CancellationToken,
}

impl OperatorSession {
    async fn run(
        self,
        inbound: Streaming<OpenPortalRequest>,
        first: Option<Mote>,
        motes: mpsc::Receiver<Mote>,
        mut local: LocalSubscription,
        lease: SubscriptionLease,
        tx: Outbound,
    ) {
        let errors = tx.clone();
        let send = tokio::spawn(send_to_operator(
            self.mux.clone(),
            self.portal_id,
            motes,
            tx,
            self.cancel.clone(),
        ));

        if let Some(mote) = first {
            self.publish(mote).await;
        }
        if let Some(status) = self.receive_from_operator(inbound).await {
            let _ = errors.try_send(Err(status));
        }
        drop(errors);

        self.cancel.cancel();
        if let Err(err) = send.await {
            warn!(portal_id = self.portal_id, error = %err, "operator send task failed");
        }
        local.cancel();
        lease.release();
        info!(portal_id = self.portal_id, "operator detached");
    }

    /// Publish inbound motes until the stream ends. A rejected frame ends the
    /// session and its status is handed back to the operator.
    async fn receive_from_operator(
        &self,
        mut inbound: Streaming<OpenPortalRequest>,
    ) -> Option<Status> {
        loop {
            let request = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                request = inbound.message() => request,
            };
            match request {
                Ok(Some(request)) => {
                    if let Some(mote) = request.mote {
                        self.publish(mote).await;
                    }
                }
                Ok(None) => {
                    debug!(portal_id = self.portal_id, "operator closed its stream");
                    return None;
                }
                Err(status) if status.code() == Code::InvalidArgument => {
                    warn!(portal_id = self.portal_id, %status, "rejected operator frame");
                    return Some(status);
                }
                Err(status) => {
                    debug!(portal_id = self.portal_id, %status, "operator stream failed");
                    return None;
                }
            }
        }
    }

    async fn publish(&self, mut mote: Mote) {
        let server_id = self.mux.server_id();
        stamp(&mut mote, TraceEventKind::ServerUserRecv, server_id);
        stamp(&mut mote, TraceEventKind::ServerUserPub, server_id);
        if let Err(err) = self.mux.publish(&topic_in(self.portal_id), mote).await {
            warn!(portal_id = self.portal_id, error = %err, "failed to publish operator mote");
        }
    }
}

/// Forward egress motes to the operator. A CLOSE mote is delivered and then
/// ends the session.
async fn send_to_operator(
    mux: Mux,
    portal_id: i64,
    mut motes: mpsc::Receiver<Mote>,
    tx: Outbound,
    cancel: CancellationToken,
) {
    loop {
        let mut mote = tokio::select! {
            _ = cancel.cancelled() => break,
            mote = motes.recv() => match mote {
                Some(mote) => mote,
                None => break,
            },
        };
        stamp(&mut mote, TraceEventKind::ServerUserSub, mux.server_id());
        stamp(&mut mote, TraceEventKind::ServerUserSend, mux.server_id());
        let close = mote.is_bytes_kind(BytesPayloadKind::Close);
        if tx
            .send(Ok(OpenPortalResponse { mote: Some(mote) }))
            .await
            .is_err()
        {
            debug!(portal_id, "operator response stream dropped");
            break;
        }
        if close {
            debug!(portal_id, "close mote delivered, ending operator session");
            break;
        }
    }
    cancel.cancel();
}

/// Keep `user_id` listed as an active user while the session lasts.
async fn heartbeat(
    store: Arc<dyn PortalStore>,
    portal_id: i64,
    user_id: i64,
    cancel: CancellationToken,
) {
    let mut ticks = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticks.tick() => {}
        }
        if let Err(err) = store.touch_active_user(portal_id, user_id, Utc::now()).await {
            debug!(portal_id, user_id, error = %err, "active user heartbeat failed");
        }
    }
}
