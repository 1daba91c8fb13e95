//! Bounded buffer of sent but unacknowledged messages.

use crate::config::ReplayConfig;
use std::collections::VecDeque;
use tether_wire::TransportMessage;
use tracing::debug;

/// Unacknowledged messages in seq order, bounded by count and payload bytes
#[derive(Debug)]
pub struct ReplayBuffer {
    entries: VecDeque<TransportMessage>,
    bytes: usize,
    limits: ReplayConfig,
}

impl ReplayBuffer {
    /// Create an empty buffer
    pub fn new(limits: ReplayConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            limits,
        }
    }

    /// Append a message; returns whatever had to be evicted to stay within
    /// bounds, oldest first. The appended message itself is evicted when it
    /// alone exceeds the byte limit.
    pub fn push(&mut self, msg: TransportMessage) -> Vec<TransportMessage> {
        debug_assert!(self.entries.back().map_or(true, |last| last.seq < msg.seq));
        self.bytes += msg.payload.len();
        self.entries.push_back(msg);

        let mut evicted = Vec::new();
        while self.over_limit() {
            match self.entries.pop_front() {
                Some(oldest) => {
                    self.bytes -= oldest.payload.len();
                    debug!("Replay buffer full, evicting seq={}", oldest.seq);
                    evicted.push(oldest);
                }
                None => break,
            }
        }
        evicted
    }

    fn over_limit(&self) -> bool {
        self.entries.len() > self.limits.max_messages
            || self.limits.max_bytes.map_or(false, |max| self.bytes > max)
    }

    /// Drop every message with seq <= `up_to_inclusive`; returns how many
    pub fn truncate_through(&mut self, up_to_inclusive: u64) -> usize {
        let mut removed = 0;
        while let Some(front) = self.entries.front() {
            if front.seq > up_to_inclusive {
                break;
            }
            if let Some(msg) = self.entries.pop_front() {
                self.bytes -= msg.payload.len();
                removed += 1;
            }
        }
        removed
    }

    /// Messages with seq > `from_exclusive`, in order
    pub fn range(&self, from_exclusive: u64) -> impl Iterator<Item = &TransportMessage> {
        self.entries.iter().filter(move |msg| msg.seq > from_exclusive)
    }

    /// Seq of the oldest buffered message
    pub fn oldest_seq(&self) -> Option<u64> {
        self.entries.front().map(|msg| msg.seq)
    }

    /// Number of buffered messages
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total buffered payload bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Remove everything, oldest first
    pub fn take_all(&mut self) -> Vec<TransportMessage> {
        self.bytes = 0;
        self.entries.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tether_wire::OutgoingMessage;

    fn msg(seq: u64, len: usize) -> TransportMessage {
        OutgoingMessage::new("s", Bytes::from(vec![0u8; len])).into_transport(
            format!("m{}", seq),
            "a".into(),
            "b".into(),
            seq,
            0,
        )
    }

    fn limits(max_messages: usize, max_bytes: Option<usize>) -> ReplayConfig {
        ReplayConfig {
            max_messages,
            max_bytes,
        }
    }

    #[test]
    fn test_count_eviction_oldest_first() {
        let mut buf = ReplayBuffer::new(limits(3, None));
        let mut evicted = Vec::new();
        for seq in 1..=5 {
            evicted.extend(buf.push(msg(seq, 1)));
        }

        let evicted: Vec<u64> = evicted.iter().map(|m| m.seq).collect();
        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(buf.oldest_seq(), Some(3));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_byte_eviction() {
        let mut buf = ReplayBuffer::new(limits(100, Some(10)));
        assert!(buf.push(msg(1, 4)).is_empty());
        assert!(buf.push(msg(2, 4)).is_empty());
        let evicted = buf.push(msg(3, 4));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].seq, 1);
        assert_eq!(buf.bytes(), 8);

        // a single oversized message cannot be kept
        let evicted = buf.push(msg(4, 32));
        assert_eq!(evicted.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert!(buf.is_empty());
        assert_eq!(buf.bytes(), 0);
    }

    #[test]
    fn test_truncate_and_range() {
        let mut buf = ReplayBuffer::new(limits(10, None));
        for seq in 1..=5 {
            buf.push(msg(seq, 2));
        }

        assert_eq!(buf.truncate_through(3), 3);
        assert_eq!(buf.truncate_through(2), 0);
        assert_eq!(buf.bytes(), 4);

        let rest: Vec<u64> = buf.range(0).map(|m| m.seq).collect();
        assert_eq!(rest, vec![4, 5]);
        let rest: Vec<u64> = buf.range(4).map(|m| m.seq).collect();
        assert_eq!(rest, vec![5]);

        let taken: Vec<u64> = buf.take_all().iter().map(|m| m.seq).collect();
        assert_eq!(taken, vec![4, 5]);
        assert_eq!(buf.oldest_seq(), None);
        assert_eq!(buf.bytes(), 0);
    }
}
