//! Latency tracing for round trips through a Portal.
//!
//! A TRACE bytes mote carries an encoded [`TraceData`]. Every hop appends a
//! [`TraceEvent`] so the originator can break the round trip down per step.

use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;

use crate::mote::Payload;
use crate::{BytesPayload, BytesPayloadKind, CodecError, Mote};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TraceData {
    #[prost(int64, tag = "1")]
    pub start_micros: i64,
    #[prost(bytes = "vec", tag = "2")]
    pub padding: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub events: ::prost::alloc::vec::Vec<TraceEvent>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TraceEvent {
    #[prost(enumeration = "TraceEventKind", tag = "1")]
    pub kind: i32,
    #[prost(int64, tag = "2")]
    pub timestamp_micros: i64,
    #[prost(string, tag = "3")]
    pub server_id: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TraceEventKind {
    Unspecified = 0,
    UserSend = 1,
    ServerUserRecv = 2,
    ServerUserPub = 3,
    ServerAgentSub = 4,
    ServerAgentSend = 5,
    AgentRecv = 6,
    AgentSend = 7,
    ServerAgentRecv = 8,
    ServerAgentPub = 9,
    ServerUserSub = 10,
    ServerUserSend = 11,
    UserRecv = 12,
}

impl TraceEventKind {
    pub fn name(self) -> &'static str {
        match self {
            TraceEventKind::Unspecified => "UNSPECIFIED",
            TraceEventKind::UserSend => "USER_SEND",
            TraceEventKind::ServerUserRecv => "SERVER_USER_RECV",
            TraceEventKind::ServerUserPub => "SERVER_USER_PUB",
            TraceEventKind::ServerAgentSub => "SERVER_AGENT_SUB",
            TraceEventKind::ServerAgentSend => "SERVER_AGENT_SEND",
            TraceEventKind::AgentRecv => "AGENT_RECV",
            TraceEventKind::AgentSend => "AGENT_SEND",
            TraceEventKind::ServerAgentRecv => "SERVER_AGENT_RECV",
            TraceEventKind::ServerAgentPub => "SERVER_AGENT_PUB",
            TraceEventKind::ServerUserSub => "SERVER_USER_SUB",
            TraceEventKind::ServerUserSend => "SERVER_USER_SEND",
            TraceEventKind::UserRecv => "USER_RECV",
        }
    }
}

pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Build a fresh TRACE mote whose data is `padding` zero bytes plus a start stamp.
pub fn new_trace_mote(stream_id: impl Into<String>, padding: usize) -> Mote {
    let data = TraceData {
        start_micros: now_micros(),
        padding: vec![0; padding],
        events: Vec::new(),
    };
    Mote {
        stream_id: stream_id.into(),
        seq_id: 0,
        payload: Some(Payload::Bytes(BytesPayload {
            data: data.encode_to_vec(),
            kind: BytesPayloadKind::Trace as i32,
        })),
    }
}

/// Decode the trace carried by `mote`, if it is a TRACE bytes mote.
pub fn trace_data(mote: &Mote) -> Option<Result<TraceData, CodecError>> {
    match &mote.payload {
        Some(Payload::Bytes(bytes)) if bytes.kind() == BytesPayloadKind::Trace => {
            Some(TraceData::decode(bytes.data.as_slice()).map_err(CodecError::from))
        }
        _ => None,
    }
}

/// Append an event stamped with the current time. Non-trace motes are left untouched.
pub fn append_trace_event(
    mote: &mut Mote,
    kind: TraceEventKind,
    server_id: Option<&str>,
) -> Result<(), CodecError> {
    let Some(Payload::Bytes(bytes)) = mote.payload.as_mut() else {
        return Ok(());
    };
    if bytes.kind() != BytesPayloadKind::Trace {
        return Ok(());
    }
    let mut data = TraceData::decode(bytes.data.as_slice())?;
    data.events.push(TraceEvent {
        kind: kind as i32,
        timestamp_micros: now_micros(),
        server_id: server_id.unwrap_or_default().to_string(),
    });
    bytes.data = data.encode_to_vec();
    Ok(())
}
