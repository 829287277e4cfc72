//! Scheduler configuration, round bookkeeping and reports.

use crate::id::{NodeId, RoundId, TransactionId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Scheduler settings. Chosen at runtime construction.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How many times one handler may be attempted in a single round. A
    /// handler still delaying after this many attempts fails the round.
    /// Values below 1 are treated as 1.
    pub max_attempts_per_handler: u32,

    /// Evaluate independent handler groups on worker threads. Only honored
    /// with the `parallel` feature; results are identical either way.
    pub parallel: bool,
}

impl SchedulerConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

    pub fn attempt_budget(&self) -> u32 {
        self.max_attempts_per_handler.max(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_handler: Self::DEFAULT_MAX_ATTEMPTS,
            parallel: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Round state
// ---------------------------------------------------------------------------

/// Counters that survive across rounds.
#[derive(Debug, Clone, Default)]
pub struct RoundState {
    /// Id of the next round to run. Advances only on success.
    pub round: RoundId,
    /// Next transaction id. Never rewinds, even when a round fails.
    pub next_transaction: u64,
}

impl RoundState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of one successful round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub round: RoundId,
    /// Handlers scheduled this round.
    pub scheduled: usize,
    /// Handlers that committed, in attach order.
    pub committed: Vec<NodeId>,
    /// Handlers that rolled back, in attach order.
    pub rolled_back: Vec<NodeId>,
    /// Total handler invocations, including retries.
    pub attempts: usize,
    /// `Delay` responses that were retried.
    pub delays: usize,
    pub first_transaction: Option<TransactionId>,
    pub last_transaction: Option<TransactionId>,
    /// Nets whose committed value changed, including mirror and latch
    /// effects.
    pub changed_nets: usize,
    pub mirrors_fired: usize,
}

/// Why [`Runtime::run`](crate::runtime::Runtime::run) stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    /// Nothing left to schedule.
    Quiescent,
    /// The cancel token was set; the in-flight round completed first.
    Cancelled,
    /// `max_rounds` rounds ran.
    RoundLimit,
}

/// Result of a multi-round run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub rounds: Vec<RoundReport>,
    pub stop: RunStop,
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation, honored only between rounds.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// A simple deterministic hash of committed state, used for determinism
/// checks and for generated component names.
///
/// Uses FNV-1a (64-bit) for speed and simplicity. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    /// Start a new hash.
    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    /// Feed bytes into the hash.
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_u64(s.len() as u64);
        self.write(s.as_bytes());
    }

    /// Finalize and return the hash value.
    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}
