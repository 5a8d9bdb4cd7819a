use std::time::Duration;

use portal_proto::trace::TraceEventKind;
use portal_proto::{BytesPayloadKind, CreatePortalRequest, CreatePortalResponse, Mote};
use portal_stream::Sequencer;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status, Streaming};
use tracing::{debug, info, warn};

use super::{stamp, PortalService, RESPONSE_BUFFER};
use crate::metrics;
use crate::mux::{topic_in, topic_out, LocalSubscription, Mux, PortalTeardown};

const KEEPALIVE_STREAM_ID: &str = "tavern-keepalive";

type Outbound = mpsc::Sender<Result<CreatePortalResponse, Status>>;

/// Open a Portal for the agent's task and spawn its session. The Portal is
/// closed when the session ends.
pub(super) async fn start(
    service: &PortalService,
    mut inbound: Streaming<CreatePortalRequest>,
) -> Result<ReceiverStream<Result<CreatePortalResponse, Status>>, Status> {
    let registration = inbound
        .message()
        .await?
        .ok_or_else(|| Status::invalid_argument("missing task registration"))?;
    let task_id = registration.task_id;
    if task_id <= 0 {
        return Err(Status::invalid_argument("task_id is required"));
    }

    let (portal, teardown) = service
        .mux
        .create_portal(service.store.clone(), task_id)
        .await?;
    let (motes, local) = service.mux.subscribe(&topic_in(portal.id));
    let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);

    metrics::PORTAL_SESSIONS.with_label_values(&["agent"]).inc();
    info!(portal_id = portal.id, task_id, "agent attached");

    let session = AgentSession {
        mux: service.mux.clone(),
        portal_id: portal.id,
        cancel: CancellationToken::new(),
    };
    tokio::spawn(session.run(
        inbound,
        registration.mote,
        motes,
        local,
        teardown,
        tx,
        service.agent_keepalive,
    ));
    Ok(ReceiverStream::new(rx))
}

struct AgentSession {
    mux: Mux,
    portal_id: i64,
    cancel: CancellationToken,
}

impl AgentSession {
    #[allow(clippy::too_many_arguments)]
    async fn run(
        self,
        inbound: Streaming<CreatePortalRequest>,
        first: Option<Mote>,
        motes: mpsc::Receiver<Mote>,
        mut local: LocalSubscription,
        teardown: PortalTeardown,
        tx: Outbound,
        keepalive: Option<Duration>,
    ) {
        let errors = tx.clone();
        let send = tokio::spawn(send_to_agent(
            self.mux.clone(),
            self.portal_id,
            motes,
            tx,
            keepalive,
            self.cancel.clone(),
        ));

        if let Some(mote) = first {
            self.publish(mote).await;
        }
        if let Some(status) = self.receive_from_agent(inbound).await {
            let _ = errors.try_send(Err(status));
        }
        drop(errors);

        self.cancel.cancel();
        if let Err(err) = send.await {
            warn!(portal_id = self.portal_id, error = %err, "agent send task failed");
        }
        local.cancel();
        teardown.close().await;
        info!(portal_id = self.portal_id, "agent detached");
    }

    /// Publish inbound motes until the stream ends. A rejected frame ends the
    /// session and its status is handed back to the agent.
    async fn receive_from_agent(
        &self,
        mut inbound: Streaming<CreatePortalRequest>,
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
                    debug!(portal_id = self.portal_id, "agent closed its stream");
                    return None;
                }
                Err(status) if status.code() == Code::InvalidArgument => {
                    warn!(portal_id = self.portal_id, %status, "rejected agent frame");
                    return Some(status);
                }
                Err(status) => {
                    debug!(portal_id = self.portal_id, %status, "agent stream failed");
                    return None;
                }
            }
        }
    }

    async fn publish(&self, mut mote: Mote) {
        if mote.is_bytes_kind(BytesPayloadKind::Keepalive) {
            return;
        }
        let server_id = self.mux.server_id();
        stamp(&mut mote, TraceEventKind::ServerAgentRecv, server_id);
        stamp(&mut mote, TraceEventKind::ServerAgentPub, server_id);
        if let Err(err) = self.mux.publish(&topic_out(self.portal_id), mote).await {
            warn!(portal_id = self.portal_id, error = %err, "failed to publish agent mote");
        }
    }
}

/// Forward ingress motes to the agent, interleaving PING motes when a
/// keepalive interval is configured.
async fn send_to_agent(
    mux: Mux,
    portal_id: i64,
    mut motes: mpsc::Receiver<Mote>,
    tx: Outbound,
    keepalive: Option<Duration>,
    cancel: CancellationToken,
) {
    let pings = Sequencer::new(KEEPALIVE_STREAM_ID);
    let mut ticks = keepalive.map(|every| {
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticks
    });

    loop {
        let mote = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = next_tick(&mut ticks) => pings.new_bytes_mote(Vec::new(), BytesPayloadKind::Ping),
            mote = motes.recv() => match mote {
                Some(mut mote) => {
                    stamp(&mut mote, TraceEventKind::ServerAgentSub, mux.server_id());
                    stamp(&mut mote, TraceEventKind::ServerAgentSend, mux.server_id());
                    mote
                }
                None => break,
            },
        };
        if tx
            .send(Ok(CreatePortalResponse { mote: Some(mote) }))
            .await
            .is_err()
        {
            debug!(portal_id, "agent response stream dropped");
            break;
        }
    }
    cancel.cancel();
}

async fn next_tick(ticks: &mut Option<tokio::time::Interval>) {
    match ticks {
        Some(ticks) => {
            ticks.tick().await;
        }
        None => std::future::pending().await,
    }
}
