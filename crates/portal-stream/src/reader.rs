use std::collections::BTreeMap;
use std::time::Duration;

use portal_proto::Mote;
use tokio::time::Instant;
use tracing::trace;

use crate::{MoteSource, StaleStream, StreamError, StreamResult};

pub const DEFAULT_MAX_BUFFER: usize = 1024;
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Out-of-order motes held while waiting for a gap to fill.
    pub max_buffer: usize,
    /// How long a gap may stay open before the stream is declared stale.
    pub stale_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_buffer: DEFAULT_MAX_BUFFER,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
        }
    }
}

/// Reassembles one stream into `seq_id` order.
///
/// Motes behind the cursor are duplicates and are dropped. Motes ahead of it
/// wait in a bounded buffer; if the gap does not close within
/// `stale_timeout`, or the buffer outgrows `max_buffer`, `read` fails with
/// [`StaleStream`] and the caller is expected to tear the stream down.
pub struct OrderedReader<S> {
    source: S,
    config: ReaderConfig,
    next_expected: u64,
    buffer: BTreeMap<u64, Mote>,
    first_buffered_at: Option<Instant>,
}

impl<S: MoteSource> OrderedReader<S> {
    pub fn new(source: S) -> Self {
        Self::with_config(source, ReaderConfig::default())
    }

    pub fn with_config(source: S, config: ReaderConfig) -> Self {
        Self {
            source,
            config,
            next_expected: 0,
            buffer: BTreeMap::new(),
            first_buffered_at: None,
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub async fn read(&mut self) -> StreamResult<Mote> {
        loop {
            if let Some(mote) = self.buffer.remove(&self.next_expected) {
                return Ok(self.emit(mote));
            }

            let mote = match self.gap_deadline() {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(self.gap_timeout());
                    }
                    match tokio::time::timeout_at(deadline, self.source.recv_mote()).await {
                        Ok(received) => received?,
                        Err(_) => return Err(self.gap_timeout()),
                    }
                }
                None => self.source.recv_mote().await?,
            };

            if mote.seq_id == self.next_expected {
                return Ok(self.emit(mote));
            }
            if mote.seq_id < self.next_expected {
                trace!(
                    stream_id = %mote.stream_id,
                    seq_id = mote.seq_id,
                    next_expected = self.next_expected,
                    "dropping duplicate mote"
                );
                continue;
            }

            if self.buffer.contains_key(&mote.seq_id) {
                continue;
            }
            self.buffer.insert(mote.seq_id, mote);
            if self.first_buffered_at.is_none() {
                self.first_buffered_at = Some(Instant::now());
            }
            if self.buffer.len() > self.config.max_buffer {
                return Err(StaleStream::BufferOverflow {
                    buffered: self.buffer.len(),
                    limit: self.config.max_buffer,
                }
                .into());
            }
        }
    }

    fn emit(&mut self, mote: Mote) -> Mote {
        self.next_expected += 1;
        self.first_buffered_at = if self.buffer.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        mote
    }

    fn gap_deadline(&self) -> Option<Instant> {
        self.first_buffered_at
            .map(|first| first + self.config.stale_timeout)
    }

    fn gap_timeout(&self) -> StreamError {
        let elapsed = self
            .first_buffered_at
            .map(|first| first.elapsed())
            .unwrap_or_default();
        StaleStream::GapTimeout {
            waiting_for: self.next_expected,
            elapsed_ms: elapsed.as_millis(),
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use portal_proto::mote::Payload;
    use portal_proto::ReplPayload;
    use tokio::sync::mpsc;

    use super::*;

    fn mote(seq_id: u64) -> Mote {
        Mote {
            stream_id: "reader-test".into(),
            seq_id,
            payload: Some(Payload::Repl(ReplPayload {
                data: seq_id.to_be_bytes().to_vec(),
            })),
        }
    }

    async fn feed(seqs: &[u64]) -> mpsc::Receiver<Mote> {
        let (tx, rx) = mpsc::channel(seqs.len().max(1));
        for seq in seqs {
            tx.send(mote(*seq)).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn reorders_out_of_order_motes() {
        let mut reader = OrderedReader::new(feed(&[2, 0, 1, 3]).await);
        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(reader.read().await.unwrap().seq_id);
        }
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn drops_duplicates() {
        let mut reader = OrderedReader::new(feed(&[0, 0, 1]).await);
        assert_eq!(reader.read().await.unwrap().seq_id, 0);
        assert_eq!(reader.read().await.unwrap().seq_id, 1);
        // Source is drained and its sender dropped.
        assert!(matches!(reader.read().await, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn gap_times_out() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(mote(1)).await.unwrap();
        let mut reader = OrderedReader::with_config(
            rx,
            ReaderConfig {
                max_buffer: 16,
                stale_timeout: Duration::from_millis(100),
            },
        );

        let started = std::time::Instant::now();
        let err = reader.read().await.unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(
            err,
            StreamError::Stale(StaleStream::GapTimeout { waiting_for: 0, .. })
        ));
        assert!(err.to_string().contains("waiting_for: 0"), "{err}");
        assert!(waited >= Duration::from_millis(100), "{waited:?}");
        assert!(waited < Duration::from_secs(2), "{waited:?}");
        drop(tx);
    }

    #[tokio::test]
    async fn overflow_is_stale() {
        let mut reader = OrderedReader::with_config(
            feed(&[1, 2, 3, 4]).await,
            ReaderConfig {
                max_buffer: 3,
                stale_timeout: Duration::from_secs(30),
            },
        );
        let err = reader.read().await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Stale(StaleStream::BufferOverflow {
                buffered: 4,
                limit: 3
            })
        ));
    }

    #[tokio::test]
    async fn emitting_a_run_restarts_the_gap_clock() {
        let (tx, rx) = mpsc::channel(8);
        let mut reader = OrderedReader::with_config(
            rx,
            ReaderConfig {
                max_buffer: 8,
                stale_timeout: Duration::from_millis(150),
            },
        );
        tx.send(mote(1)).await.unwrap();
        tx.send(mote(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(mote(0)).await.unwrap();

        assert_eq!(reader.read().await.unwrap().seq_id, 0);
        assert_eq!(reader.read().await.unwrap().seq_id, 1);
        // seq 3 is still parked; the clock restarted when 1 was emitted.
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(mote(2)).await.unwrap();
        assert_eq!(reader.read().await.unwrap().seq_id, 2);
        assert_eq!(reader.read().await.unwrap().seq_id, 3);
    }
}
