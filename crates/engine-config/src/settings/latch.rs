use engine_core::latch::{AcquirePolicy, DrainTiming};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long the migration waits for the database to become quiescent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatchSettings {
    /// Bound on the plain drain that always runs first.
    pub drain_timeout_ms: u64,
    /// Bound on the forced drain that runs when the plain one timed out.
    pub force_drain_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub interrupt_grace_ms: u64,
    pub policy: AcquirePolicy,
}

impl Default for LatchSettings {
    fn default() -> Self {
        LatchSettings {
            drain_timeout_ms: 30_000,
            force_drain_timeout_ms: 10_000,
            poll_interval_ms: 100,
            interrupt_grace_ms: 2_000,
            policy: AcquirePolicy::Reject,
        }
    }
}

impl LatchSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn force_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.force_drain_timeout_ms)
    }

    pub fn drain_timing(&self) -> DrainTiming {
        DrainTiming {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            interrupt_grace: Duration::from_millis(self.interrupt_grace_ms),
        }
    }
}
