//! Retry policy for datagram delivery
//!
//! The replication transport is lossy, so every outbound protocol message is
//! sent as a short burst of identical copies. Receivers are idempotent, which
//! makes duplicates harmless.

use crate::directory::NodeId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many copies of a datagram to send and how far apart
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of copies sent per message (at least 1)
    pub attempts: u32,
    /// Base delay between two copies
    #[serde(with = "serde_millis")]
    pub delay: Duration,
    /// Jitter factor to randomize delays (0.0 disables jitter)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(10),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy without jitter
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            jitter_factor: 0.0,
        }
    }

    /// Single send, no repetition
    pub fn single() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Fast bursts for low-latency links
    pub fn quick() -> Self {
        Self {
            attempts: 2,
            delay: Duration::from_millis(2),
            jitter_factor: 0.1,
        }
    }

    /// Number of copies, never less than one
    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Delay to wait after copy number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt >= self.attempts() {
            return Duration::ZERO;
        }
        jittered(self.delay, self.jitter_factor)
    }

    /// Randomized wait before starting an election.
    ///
    /// The upper bound grows with the identifier's rank inside a group of
    /// four so that backups detecting the same failure rarely fire together.
    pub fn election_backoff(id: NodeId, max_jitter: Duration) -> Duration {
        if max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let rank = (id.0 % 4) as f64 + 1.0;
        let upper = max_jitter.as_secs_f64() * rank / 4.0;
        Duration::from_secs_f64(rand::random::<f64>() * upper)
    }
}

/// Apply +/- `factor` random jitter to `base`
fn jittered(base: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || base.is_zero() {
        return base;
    }
    let base_nanos = base.as_nanos() as f64;
    let jitter_range = base_nanos * factor;
    let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
    Duration::from_nanos((base_nanos + jitter).max(0.0) as u64)
}
