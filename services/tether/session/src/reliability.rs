//! Sequencing, acknowledgment and duplicate suppression for one session

use crate::config::ReplayConfig;
use crate::replay::ReplayBuffer;
use tether_wire::{OutgoingMessage, PeerId, TransportMessage};
use thiserror::Error;

/// Peer broke the sequencing rules
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    /// Peer acknowledged a seq that was never sent
    #[error("ack {ack} beyond last sent seq {last_sent}")]
    AckBeyondSent {
        /// Received ack
        ack: u64,
        /// Highest seq assigned so far
        last_sent: u64,
    },
    /// An application message skipped ahead
    #[error("expected seq {expected}, got {got}")]
    Gap {
        /// Next seq in order
        expected: u64,
        /// Received seq
        got: u64,
    },
    /// Application messages start at seq 1
    #[error("application message with seq 0")]
    ZeroSeq,
}

/// Send side of a session
#[derive(Debug)]
pub struct SendState {
    /// Next seq to assign, starting from 1 (0 is reserved for control messages)
    next_seq: u64,
    /// Highest seq the peer has acknowledged
    cum_acked: u64,
    /// Sent but unacknowledged messages
    replay: ReplayBuffer,
}

impl SendState {
    /// Create a send state for a new session
    pub fn new(limits: ReplayConfig) -> Self {
        Self {
            next_seq: 1,
            cum_acked: 0,
            replay: ReplayBuffer::new(limits),
        }
    }

    /// Seq the next message will carry
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Highest acknowledged seq
    pub fn cum_acked(&self) -> u64 {
        self.cum_acked
    }

    /// Oldest seq still held for replay, or the next seq when nothing is held
    pub fn next_unacked_seq(&self) -> u64 {
        self.replay.oldest_seq().unwrap_or(self.next_seq)
    }

    /// Number of buffered messages
    pub fn buffered(&self) -> usize {
        self.replay.len()
    }

    /// Buffered payload bytes
    pub fn buffered_bytes(&self) -> usize {
        self.replay.bytes()
    }

    /// Stamp an outgoing message with the next seq without consuming it
    pub fn stamp(
        &self,
        msg: OutgoingMessage,
        id: String,
        from: PeerId,
        to: PeerId,
        ack: u64,
    ) -> TransportMessage {
        msg.into_transport(id, from, to, self.next_seq, ack)
    }

    /// Consume the seq of a stamped message and buffer it for replay;
    /// returns messages evicted from the buffer, oldest first
    pub fn commit(&mut self, msg: TransportMessage) -> Vec<TransportMessage> {
        debug_assert_eq!(msg.seq, self.next_seq);
        self.next_seq += 1;
        self.replay.push(msg)
    }

    /// Apply a cumulative ack; returns how many buffered messages it released
    pub fn process_ack(&mut self, ack: u64) -> Result<usize, SequenceError> {
        let last_sent = self.next_seq - 1;
        if ack > last_sent {
            return Err(SequenceError::AckBeyondSent { ack, last_sent });
        }
        if ack <= self.cum_acked {
            return Ok(0);
        }
        self.cum_acked = ack;
        Ok(self.replay.truncate_through(ack))
    }

    /// Whether a peer that has received everything up to `remote_last_received`
    /// can be brought up to date from this buffer.
    ///
    /// Seqs between `remote_last_received` and the oldest buffered message
    /// were evicted and already reported lost, so they do not block a resume.
    /// A peer that reports less than it has acknowledged has lost its state.
    pub fn can_resume_from(&self, remote_last_received: u64) -> Result<(), String> {
        let last_sent = self.next_seq - 1;
        if remote_last_received > last_sent {
            return Err(format!(
                "peer claims seq {} but only {} were sent",
                remote_last_received, last_sent
            ));
        }
        if remote_last_received < self.cum_acked {
            return Err(format!(
                "peer acknowledged seq {} but now reports only {}",
                self.cum_acked, remote_last_received
            ));
        }
        Ok(())
    }

    /// Buffered messages the peer has not seen, in order, restamped with `ack`
    pub fn replay_after(&self, remote_last_received: u64, ack: u64) -> Vec<TransportMessage> {
        self.replay
            .range(remote_last_received)
            .map(|msg| TransportMessage {
                ack,
                ..msg.clone()
            })
            .collect()
    }

    /// Give up on every buffered message, oldest first
    pub fn abandon(&mut self) -> Vec<TransportMessage> {
        self.replay.take_all()
    }
}

/// What to do with an inbound application message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receive {
    /// Next in order
    Deliver,
    /// Already delivered
    Duplicate,
}

/// Receive side of a session
#[derive(Debug, Default)]
pub struct RecvState {
    /// Highest seq delivered from the peer
    last_received: u64,
}

impl RecvState {
    /// Highest delivered seq; this is the ack piggybacked on every send
    pub fn last_received(&self) -> u64 {
        self.last_received
    }

    /// Classify an inbound seq
    pub fn classify(&self, seq: u64) -> Result<Receive, SequenceError> {
        if seq == 0 {
            return Err(SequenceError::ZeroSeq);
        }
        if seq <= self.last_received {
            return Ok(Receive::Duplicate);
        }
        if seq == self.last_received + 1 {
            return Ok(Receive::Deliver);
        }
        Err(SequenceError::Gap {
            expected: self.last_received + 1,
            got: seq,
        })
    }

    /// Record delivery of the next seq
    pub fn advance(&mut self) {
        self.last_received += 1;
    }

    /// Move past seqs the peer evicted so the next expected seq is
    /// `next_seq`; returns how many were skipped
    pub fn skip_to(&mut self, next_seq: u64) -> u64 {
        let through = next_seq.saturating_sub(1);
        if through <= self.last_received {
            return 0;
        }
        let skipped = through - self.last_received;
        self.last_received = through;
        skipped
    }
}
