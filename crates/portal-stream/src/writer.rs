use portal_proto::{BytesPayloadKind, Mote};

use crate::{MoteSink, Sequencer, StreamResult};

/// Stamps outgoing motes and hands them to a sink. Sink errors come back
/// unchanged; nothing is buffered or retried.
pub struct OrderedWriter<S> {
    sequencer: Sequencer,
    sink: S,
}

impl<S: MoteSink> OrderedWriter<S> {
    pub fn new(stream_id: impl Into<String>, sink: S) -> Self {
        Self {
            sequencer: Sequencer::new(stream_id),
            sink,
        }
    }

    pub fn stream_id(&self) -> &str {
        self.sequencer.stream_id()
    }

    async fn send(&self, mote: Mote) -> StreamResult<()> {
        self.sink.send_mote(mote).await
    }

    pub async fn write_bytes(&self, data: Vec<u8>, kind: BytesPayloadKind) -> StreamResult<()> {
        self.send(self.sequencer.new_bytes_mote(data, kind)).await
    }

    pub async fn write_tcp(&self, data: Vec<u8>, dst_addr: &str, dst_port: u32) -> StreamResult<()> {
        self.send(self.sequencer.new_tcp_mote(data, dst_addr, dst_port))
            .await
    }

    pub async fn write_udp(&self, data: Vec<u8>, dst_addr: &str, dst_port: u32) -> StreamResult<()> {
        self.send(self.sequencer.new_udp_mote(data, dst_addr, dst_port))
            .await
    }

    pub async fn write_repl(&self, data: Vec<u8>) -> StreamResult<()> {
        self.send(self.sequencer.new_repl_mote(data)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::StreamError;

    #[tokio::test]
    async fn concurrent_writers_share_one_sequence() {
        let (tx, mut rx) = mpsc::channel(1024);
        let writer = Arc::new(OrderedWriter::new("shared", tx));

        let mut tasks = Vec::new();
        for worker in 0..8u8 {
            let writer = Arc::clone(&writer);
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    writer.write_repl(vec![worker]).await.expect("write");
                }
            }));
        }
        for task in tasks {
            task.await.expect("writer task");
        }
        drop(writer);

        let mut seen = Vec::new();
        while let Some(mote) = rx.recv().await {
            seen.push(mote.seq_id);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..400).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn sink_error_is_returned() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let writer = OrderedWriter::new("gone", tx);
        let err = writer
            .write_bytes(b"x".to_vec(), BytesPayloadKind::Data)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Closed));
    }
}
