/// A single sequenced message on a logical stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Mote {
    #[prost(string, tag = "1")]
    pub stream_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub seq_id: u64,
    #[prost(oneof = "mote::Payload", tags = "3, 4, 5, 6")]
    pub payload: ::core::option::Option<mote::Payload>,
}

pub mod mote {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "3")]
        Bytes(super::BytesPayload),
        #[prost(message, tag = "4")]
        Tcp(super::TcpPayload),
        #[prost(message, tag = "5")]
        Udp(super::UdpPayload),
        #[prost(message, tag = "6")]
        Repl(super::ReplPayload),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BytesPayload {
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(enumeration = "BytesPayloadKind", tag = "2")]
    pub kind: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TcpPayload {
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub dst_addr: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub dst_port: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UdpPayload {
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub dst_addr: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub dst_port: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplPayload {
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum BytesPayloadKind {
    Unspecified = 0,
    Data = 1,
    Keepalive = 2,
    Trace = 3,
    Close = 4,
    Ping = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OpenPortalRequest {
    #[prost(int64, tag = "1")]
    pub portal_id: i64,
    #[prost(message, optional, tag = "2")]
    pub mote: ::core::option::Option<Mote>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OpenPortalResponse {
    #[prost(message, optional, tag = "1")]
    pub mote: ::core::option::Option<Mote>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreatePortalRequest {
    #[prost(int64, tag = "1")]
    pub task_id: i64,
    #[prost(message, optional, tag = "2")]
    pub mote: ::core::option::Option<Mote>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreatePortalResponse {
    #[prost(message, optional, tag = "1")]
    pub mote: ::core::option::Option<Mote>,
}

impl Mote {
    /// Kind of a bytes payload, `None` for the other variants.
    pub fn bytes_kind(&self) -> Option<BytesPayloadKind> {
        match &self.payload {
            Some(mote::Payload::Bytes(bytes)) => Some(bytes.kind()),
            _ => None,
        }
    }

    pub fn is_bytes_kind(&self, kind: BytesPayloadKind) -> bool {
        self.bytes_kind() == Some(kind)
    }

    /// Raw data carried by whichever payload is set.
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            Some(mote::Payload::Bytes(p)) => &p.data,
            Some(mote::Payload::Tcp(p)) => &p.data,
            Some(mote::Payload::Udp(p)) => &p.data,
            Some(mote::Payload::Repl(p)) => &p.data,
            None => &[],
        }
    }

    pub fn payload_name(&self) -> &'static str {
        match &self.payload {
            Some(mote::Payload::Bytes(_)) => "bytes",
            Some(mote::Payload::Tcp(_)) => "tcp",
            Some(mote::Payload::Udp(_)) => "udp",
            Some(mote::Payload::Repl(_)) => "repl",
            None => "none",
        }
    }
}
