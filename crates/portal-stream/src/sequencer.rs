use std::sync::atomic::{AtomicU64, Ordering};

use portal_proto::mote::Payload;
use portal_proto::{BytesPayload, BytesPayloadKind, Mote, ReplPayload, TcpPayload, UdpPayload};

/// Hands out `seq_id`s for one stream. Safe to share between tasks: every
/// call observes a distinct id, so concurrent producers still form a total
/// order starting at 0.
#[derive(Debug)]
pub struct Sequencer {
    stream_id: String,
    next_seq_id: AtomicU64,
}

impl Sequencer {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            next_seq_id: AtomicU64::new(0),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn next_seq_id(&self) -> u64 {
        self.next_seq_id.fetch_add(1, Ordering::Relaxed)
    }

    fn stamp(&self, payload: Payload) -> Mote {
        Mote {
            stream_id: self.stream_id.clone(),
            seq_id: self.next_seq_id(),
            payload: Some(payload),
        }
    }

    pub fn new_bytes_mote(&self, data: Vec<u8>, kind: BytesPayloadKind) -> Mote {
        self.stamp(Payload::Bytes(BytesPayload {
            data,
            kind: kind as i32,
        }))
    }

    pub fn new_tcp_mote(&self, data: Vec<u8>, dst_addr: impl Into<String>, dst_port: u32) -> Mote {
        self.stamp(Payload::Tcp(TcpPayload {
            data,
            dst_addr: dst_addr.into(),
            dst_port,
        }))
    }

    pub fn new_udp_mote(&self, data: Vec<u8>, dst_addr: impl Into<String>, dst_port: u32) -> Mote {
        self.stamp(Payload::Udp(UdpPayload {
            data,
            dst_addr: dst_addr.into(),
            dst_port,
        }))
    }

    pub fn new_repl_mote(&self, data: Vec<u8>) -> Mote {
        self.stamp(Payload::Repl(ReplPayload { data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_zero_and_increment() {
        let seq = Sequencer::new("stream-a");
        let ids: Vec<u64> = (0..4)
            .map(|i| seq.new_repl_mote(vec![i]).seq_id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn stamps_stream_id_and_payload() {
        let seq = Sequencer::new("stream-b");
        let mote = seq.new_udp_mote(b"query".to_vec(), "1.2.3.4", 53);
        assert_eq!(mote.stream_id, "stream-b");
        match mote.payload {
            Some(Payload::Udp(udp)) => {
                assert_eq!(udp.dst_addr, "1.2.3.4");
                assert_eq!(udp.dst_port, 53);
                assert_eq!(udp.data, b"query");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
