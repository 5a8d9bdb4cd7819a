use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use portal_proto::Mote;

/// Insertion-ordered ring of recent motes on one topic.
///
/// Bounded by a mote count and, optionally, by the payload bytes it holds.
/// The oldest entries are evicted first; the newest mote is always kept.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    entries: VecDeque<Mote>,
    capacity: usize,
    max_bytes: Option<usize>,
    bytes: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize, max_bytes: Option<usize>) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            max_bytes,
            bytes: 0,
        }
    }

    pub fn push(&mut self, mote: Mote) {
        self.bytes += mote.data().len();
        self.entries.push_back(mote);
        while self.entries.len() > 1 && self.over_budget() {
            if let Some(evicted) = self.entries.pop_front() {
                self.bytes -= evicted.data().len();
            }
        }
    }

    fn over_budget(&self) -> bool {
        self.entries.len() > self.capacity
            || self.max_bytes.is_some_and(|limit| self.bytes > limit)
    }

    pub fn snapshot(&self) -> Vec<Mote> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Per-topic rings. Writers take the map's write lock briefly; readers copy
/// a snapshot under the read lock.
#[derive(Debug)]
pub(crate) struct HistoryStore {
    capacity: usize,
    max_bytes: Option<usize>,
    rings: RwLock<HashMap<String, HistoryBuffer>>,
}

impl HistoryStore {
    pub(crate) fn new(capacity: usize, max_bytes: Option<usize>) -> Self {
        Self {
            capacity,
            max_bytes,
            rings: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn append(&self, topic: &str, mote: Mote) {
        let mut rings = self.rings.write();
        rings
            .entry(topic.to_string())
            .or_insert_with(|| HistoryBuffer::new(self.capacity, self.max_bytes))
            .push(mote);
    }

    pub(crate) fn snapshot(&self, topic: &str) -> Vec<Mote> {
        self.rings
            .read()
            .get(topic)
            .map(HistoryBuffer::snapshot)
            .unwrap_or_default()
    }

    pub(crate) fn forget(&self, topic: &str) {
        self.rings.write().remove(topic);
    }
}

#[cfg(test)]
mod tests {
    use portal_proto::mote::Payload;
    use portal_proto::{BytesPayload, BytesPayloadKind};

    use super::*;

    fn body(seq_id: u64, data: &str) -> Mote {
        Mote {
            stream_id: "history".into(),
            seq_id,
            payload: Some(Payload::Bytes(BytesPayload {
                data: data.as_bytes().to_vec(),
                kind: BytesPayloadKind::Data as i32,
            })),
        }
    }

    #[test]
    fn overwrites_oldest_at_capacity() {
        let mut ring = HistoryBuffer::new(3, None);
        for seq in 0..5 {
            ring.push(body(seq, "x"));
        }
        let seqs: Vec<u64> = ring.snapshot().iter().map(|m| m.seq_id).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(ring.bytes(), 3);
    }

    #[test]
    fn byte_budget_keeps_the_tail() {
        let mut ring = HistoryBuffer::new(1024, Some(10));
        ring.push(body(0, "12345"));
        ring.push(body(1, "67890"));
        ring.push(body(2, "ABCDE"));
        let tail: Vec<u8> = ring.snapshot().iter().flat_map(|m| m.data().to_vec()).collect();
        assert_eq!(tail, b"67890ABCDE");
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn oversized_mote_is_still_kept() {
        let mut ring = HistoryBuffer::new(8, Some(4));
        ring.push(body(0, "ab"));
        ring.push(body(1, "too large"));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.snapshot()[0].seq_id, 1);
    }

    #[test]
    fn store_keeps_topics_apart() {
        let store = HistoryStore::new(4, None);
        store.append("PORTAL_IN_1", body(0, "in"));
        store.append("PORTAL_OUT_1", body(0, "out"));
        assert_eq!(store.snapshot("PORTAL_IN_1")[0].data(), b"in");
        store.forget("PORTAL_IN_1");
        assert!(store.snapshot("PORTAL_IN_1").is_empty());
        assert_eq!(store.snapshot("PORTAL_OUT_1").len(), 1);
    }
}
