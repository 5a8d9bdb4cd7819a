//! Wire types for the Portal plane.
//!
//! A [`Mote`] is the unit of traffic carried over the two duplex Portal
//! streams and across the pub/sub backplane. Messages are plain `prost`
//! structs so they travel over gRPC unchanged. [`decode_mote`] adds the
//! strict one-payload check for backplane frames and [`StrictCodec`] applies
//! it to every frame the generated service reads.

mod codec;
mod grpc;
mod messages;
pub mod trace;

pub use codec::{check_frame, decode_mote, encode_mote, CodecError, MoteFrame};
pub use grpc::StrictCodec;
pub use messages::{
    mote, BytesPayload, BytesPayloadKind, CreatePortalRequest, CreatePortalResponse, Mote,
    OpenPortalRequest, OpenPortalResponse, ReplPayload, TcpPayload, UdpPayload,
};

/// gRPC client and server for the `portal.Portal` service.
#[allow(clippy::all)]
pub mod rpc {
    include!(concat!(env!("OUT_DIR"), "/portal.Portal.rs"));
}
