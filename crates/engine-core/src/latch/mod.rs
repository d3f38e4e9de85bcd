//! Latch protocol: stop admitting new operations on a shared resource,
//! then wait for the in-flight ones to finish.
//!
//! Latching and draining are separate on purpose. A latch only closes the
//! door; [`Latch::drain`] waits (bounded) for the operations already inside.
//! [`Latch::force_drain`] additionally interrupts and finally evicts
//! stragglers, and is meant as a last resort after a plain drain timed out.

use crate::error::LatchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

pub mod controller;

pub use controller::{LatchController, LatchTicket, Lease};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatchMode {
    /// Only this node stops admitting operations.
    Local,
    /// The latch id is propagated so every node latches with the same id.
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatchState {
    Available,
    Latched,
    Drained,
}

impl fmt::Display for LatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LatchState::Available => "AVAILABLE",
            LatchState::Latched => "LATCHED",
            LatchState::Drained => "DRAINED",
        };
        f.write_str(s)
    }
}

/// What to do when a latch is requested while one is already active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquirePolicy {
    /// Hand back the active latch.
    ReturnExisting,
    /// Fail with [`LatchError::AlreadyLatched`].
    #[default]
    Reject,
}

/// Timing knobs for draining. Operationally tuned, never hard-coded at call
/// sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainTiming {
    /// How often the held count is re-checked while draining.
    pub poll_interval: Duration,
    /// How long `force_drain` re-polls after interrupting holders before
    /// evicting them.
    pub interrupt_grace: Duration,
}

impl Default for DrainTiming {
    fn default() -> Self {
        DrainTiming {
            poll_interval: Duration::from_millis(100),
            interrupt_grace: Duration::from_secs(2),
        }
    }
}

/// An acquired block on a latchable resource.
#[async_trait]
pub trait Latch: Send + Sync {
    fn id(&self) -> &str;

    fn mode(&self) -> LatchMode;

    /// Waits until no operation holds the resource or `timeout` elapses.
    /// Returns whether the resource fully drained. Never forces anything.
    async fn drain(&self, timeout: Duration) -> bool;

    /// Drains, then interrupts holders, then forcibly releases whatever is
    /// left. Returns true only if nothing holds the resource at the end.
    async fn force_drain(&self, timeout: Duration) -> bool;

    /// Re-admits new operations. Calling it on a released latch is a no-op.
    async fn unlatch(&self);
}

/// A resource that can be latched.
///
/// `current_latch` and `is_latched` are racy: the state may change between
/// two calls and callers must tolerate that.
#[async_trait]
pub trait LatchableService: Send + Sync {
    type Latch: Latch + ?Sized;

    async fn acquire_latch(
        &self,
        mode: LatchMode,
        id: Option<String>,
    ) -> Result<Arc<Self::Latch>, LatchError>;

    fn current_latch(&self) -> Option<Arc<Self::Latch>>;

    fn is_latched(&self) -> bool {
        self.current_latch().is_some()
    }

    fn state(&self) -> LatchState;
}

/// Carries a cluster latch id to the other nodes.
#[async_trait]
pub trait LatchPropagator: Send + Sync {
    async fn propagate_latch(&self, id: &str) -> Result<(), LatchError>;

    async fn propagate_unlatch(&self, id: &str) -> Result<(), LatchError>;
}
