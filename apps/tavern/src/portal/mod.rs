//! gRPC surface of the Portal plane.
//!
//! Both RPCs are duplex streams. The first frame registers the caller
//! (`task_id` for agents, `portal_id` for operators); every later frame
//! carries a mote. Each session runs its two directions as tasks tied to one
//! cancellation token: whichever ends first takes the other down and runs
//! the session teardown.

mod agent;
mod auth;
mod operator;

use std::sync::Arc;
use std::time::Duration;

use portal_proto::rpc::portal_server::{Portal, PortalServer};
use portal_proto::trace::{append_trace_event, TraceEventKind};
use portal_proto::{
    CreatePortalRequest, CreatePortalResponse, Mote, OpenPortalRequest, OpenPortalResponse,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::InterceptedService;
use tonic::{Request, Response, Status, Streaming};
use tracing::warn;

use crate::mux::{Mux, MuxError};
use crate::store::PortalStore;

pub use auth::{ApiTokenCheck, AUTH_METADATA_KEY};
pub use operator::USER_METADATA_KEY;

/// Frames buffered towards a client before the send direction waits.
const RESPONSE_BUFFER: usize = 256;

impl From<MuxError> for Status {
    fn from(err: MuxError) -> Self {
        match &err {
            MuxError::NotFound(_) => Status::not_found(err.to_string()),
            MuxError::PortalClosed(_) => Status::failed_precondition(err.to_string()),
            MuxError::Codec(_) => Status::invalid_argument(err.to_string()),
            MuxError::Store(_) | MuxError::PubSub(_) => Status::internal(err.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct PortalService {
    mux: Mux,
    store: Arc<dyn PortalStore>,
    agent_keepalive: Option<Duration>,
}

impl PortalService {
    pub fn new(mux: Mux, store: Arc<dyn PortalStore>) -> Self {
        Self {
            mux,
            store,
            agent_keepalive: None,
        }
    }

    /// Send a PING mote to connected agents at this interval.
    pub fn with_agent_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.agent_keepalive = interval;
        self
    }

    pub fn into_server(
        self,
        auth: ApiTokenCheck,
    ) -> InterceptedService<PortalServer<Self>, ApiTokenCheck> {
        PortalServer::with_interceptor(self, auth)
    }
}

/// Append a server-side trace event; non-trace motes pass through untouched.
fn stamp(mote: &mut Mote, kind: TraceEventKind, server_id: &str) {
    if let Err(err) = append_trace_event(mote, kind, Some(server_id)) {
        warn!(
            stream_id = %mote.stream_id,
            event = kind.name(),
            error = %err,
            "failed to append trace event"
        );
    }
}

#[tonic::async_trait]
impl Portal for PortalService {
    type OpenPortalStream = ReceiverStream<Result<OpenPortalResponse, Status>>;
    type CreatePortalStream = ReceiverStream<Result<CreatePortalResponse, Status>>;

    async fn open_portal(
        &self,
        request: Request<Streaming<OpenPortalRequest>>,
    ) -> Result<Response<Self::OpenPortalStream>, Status> {
        let user_id = request
            .metadata()
            .get(USER_METADATA_KEY)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        let stream = operator::start(self, user_id, request.into_inner()).await?;
        Ok(Response::new(stream))
    }

    async fn create_portal(
        &self,
        request: Request<Streaming<CreatePortalRequest>>,
    ) -> Result<Response<Self::CreatePortalStream>, Status> {
        let stream = agent::start(self, request.into_inner()).await?;
        Ok(Response::new(stream))
    }
}
