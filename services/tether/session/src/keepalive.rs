//! Heartbeats and link liveness.
//!
//! While connected each side sends an unsequenced `ACK` message every
//! heartbeat interval carrying its current ack. Any inbound frame counts as
//! proof of life; after `heartbeats_until_dead` intervals of silence the link
//! is declared dead.

use crate::config::TransportConfig;
use bytes::Bytes;
use std::time::Duration;
use tether_wire::{ControlFlags, PeerId, TransportMessage, HEARTBEAT_STREAM_ID};
use tokio::time::Instant;

/// Build a heartbeat carrying `ack`
pub fn build_heartbeat(from: PeerId, to: PeerId, ack: u64) -> TransportMessage {
    TransportMessage::control(
        from,
        to,
        HEARTBEAT_STREAM_ID,
        ControlFlags::ACK,
        ack,
        Bytes::new(),
    )
}

/// Heartbeat schedule and liveness deadline of one connected link
#[derive(Debug, Clone)]
pub struct Liveness {
    interval: Duration,
    timeout: Duration,
    last_inbound: Instant,
    next_heartbeat: Instant,
}

impl Liveness {
    /// Start tracking at `now`; the first heartbeat goes out one interval later
    pub fn new(config: &TransportConfig, now: Instant) -> Self {
        let interval = config.heartbeat_interval();
        Self {
            interval,
            timeout: config.liveness_timeout(),
            last_inbound: now,
            next_heartbeat: now + interval,
        }
    }

    /// Any frame arrived
    pub fn record_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    /// A heartbeat went out; schedule the next one
    pub fn record_heartbeat(&mut self, now: Instant) {
        self.next_heartbeat = now + self.interval;
    }

    /// When the next heartbeat is due
    pub fn next_heartbeat(&self) -> Instant {
        self.next_heartbeat
    }

    /// When the link is declared dead absent further traffic
    pub fn deadline(&self) -> Instant {
        self.last_inbound + self.timeout
    }

    /// Earliest instant something needs doing
    pub fn next_wakeup(&self) -> Instant {
        self.next_heartbeat.min(self.deadline())
    }

    /// Whether the liveness window has elapsed
    pub fn is_dead(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Whether a heartbeat should be sent
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        now >= self.next_heartbeat
    }
}
