//! Ordered delivery over a Portal.
//!
//! Producers stamp motes with a per-stream [`Sequencer`] through an
//! [`OrderedWriter`]; consumers put an [`OrderedReader`] in front of whatever
//! delivers motes so they come out in `seq_id` order, at most once.

mod reader;
mod sequencer;
mod writer;

use async_trait::async_trait;
use portal_proto::Mote;
use thiserror::Error;
use tokio::sync::mpsc;

pub use reader::{OrderedReader, ReaderConfig, DEFAULT_MAX_BUFFER, DEFAULT_STALE_TIMEOUT};
pub use sequencer::Sequencer;
pub use writer::OrderedWriter;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StaleStream {
    #[error("stale stream: buffer overflow ({buffered} motes buffered, limit {limit})")]
    BufferOverflow { buffered: usize, limit: usize },
    #[error("stale stream: gap timeout after {elapsed_ms}ms (waiting_for: {waiting_for})")]
    GapTimeout { waiting_for: u64, elapsed_ms: u128 },
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Stale(#[from] StaleStream),
    #[error("stream closed")]
    Closed,
    #[error("stream transport error: {0}")]
    Transport(String),
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Where an [`OrderedReader`] pulls motes from.
#[async_trait]
pub trait MoteSource: Send {
    async fn recv_mote(&mut self) -> StreamResult<Mote>;
}

/// Where an [`OrderedWriter`] pushes stamped motes to.
#[async_trait]
pub trait MoteSink: Send + Sync {
    async fn send_mote(&self, mote: Mote) -> StreamResult<()>;
}

#[async_trait]
impl MoteSource for mpsc::Receiver<Mote> {
    async fn recv_mote(&mut self) -> StreamResult<Mote> {
        self.recv().await.ok_or(StreamError::Closed)
    }
}

#[async_trait]
impl MoteSink for mpsc::Sender<Mote> {
    async fn send_mote(&self, mote: Mote) -> StreamResult<()> {
        self.send(mote).await.map_err(|_| StreamError::Closed)
    }
}
