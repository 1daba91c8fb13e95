//! Reconnect scheduling: exponential backoff with jitter and an attempt ceiling

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Delay before reconnect attempt number `attempt` (0-based).
///
/// The first attempt after a link loss is immediate; after that the delay is
/// `min(base * 2^(attempt - 1), max)` plus uniform jitter in `0..=max_jitter`.
pub fn backoff_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exp = config
        .base_ms
        .saturating_mul(1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX));
    let capped = exp.min(config.max_ms);
    let jitter = if config.max_jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=config.max_jitter_ms)
    };
    Duration::from_millis(capped + jitter)
}

/// Consecutive failed attempts since the last successful handshake
#[derive(Debug, Clone)]
pub struct ReconnectState {
    config: BackoffConfig,
    attempts: u32,
}

impl ReconnectState {
    /// Create with no attempts made
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Reserve the next attempt and return its delay, or `None` once the
    /// ceiling is reached
    pub fn next_attempt(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        let delay = backoff_delay(&self.config, self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    /// Attempts reserved since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A handshake succeeded
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
