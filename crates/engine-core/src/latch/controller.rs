use crate::{
    error::LatchError,
    latch::{AcquirePolicy, DrainTiming, LatchMode, LatchPropagator, LatchState},
};
use model::cancel::{CancelState, Canceled};
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::Notify,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

type ReleaseHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct LeaseEntry {
    interrupt: CancellationToken,
    on_force_release: Option<ReleaseHook>,
}

#[derive(Debug, Clone)]
struct ActiveLatch {
    id: String,
    mode: LatchMode,
}

#[derive(Default)]
struct Inner {
    active: Option<ActiveLatch>,
    drained: bool,
    leases: HashMap<u64, LeaseEntry>,
    next_lease: u64,
}

struct Shared {
    name: String,
    inner: Mutex<Inner>,
    unlatched: Notify,
    timing: DrainTiming,
    policy: AcquirePolicy,
    propagator: Option<Arc<dyn LatchPropagator>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of a latch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatchTicket {
    pub id: String,
    pub mode: LatchMode,
    /// False when an already active latch was handed back.
    pub created: bool,
}

/// The latch mechanism behind every latchable resource: tracks the active
/// latch and the leases of operations currently holding the resource.
///
/// Operations enter through [`LatchController::lease`], which waits while
/// the resource is latched. Dropping the [`Lease`] marks the operation done.
#[derive(Clone)]
pub struct LatchController {
    shared: Arc<Shared>,
}

pub struct LatchControllerBuilder {
    name: String,
    timing: DrainTiming,
    policy: AcquirePolicy,
    propagator: Option<Arc<dyn LatchPropagator>>,
}

impl LatchControllerBuilder {
    pub fn timing(mut self, timing: DrainTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn policy(mut self, policy: AcquirePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn propagator(mut self, propagator: Arc<dyn LatchPropagator>) -> Self {
        self.propagator = Some(propagator);
        self
    }

    pub fn build(self) -> LatchController {
        LatchController {
            shared: Arc::new(Shared {
                name: self.name,
                inner: Mutex::new(Inner::default()),
                unlatched: Notify::new(),
                timing: self.timing,
                policy: self.policy,
                propagator: self.propagator,
            }),
        }
    }
}

impl LatchController {
    pub fn builder(name: impl Into<String>) -> LatchControllerBuilder {
        LatchControllerBuilder {
            name: name.into(),
            timing: DrainTiming::default(),
            policy: AcquirePolicy::default(),
            propagator: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn timing(&self) -> DrainTiming {
        self.shared.timing
    }

    /// Stops admitting new operations. Operations already holding a lease
    /// are unaffected.
    pub async fn acquire(
        &self,
        mode: LatchMode,
        id: Option<String>,
    ) -> Result<LatchTicket, LatchError> {
        let propagator = match mode {
            LatchMode::Cluster => Some(
                self.shared
                    .propagator
                    .clone()
                    .ok_or(LatchError::ClusterUnavailable)?,
            ),
            LatchMode::Local => None,
        };

        let ticket = {
            let mut inner = self.shared.lock();
            if let Some(active) = &inner.active {
                return match self.shared.policy {
                    AcquirePolicy::ReturnExisting => Ok(LatchTicket {
                        id: active.id.clone(),
                        mode: active.mode,
                        created: false,
                    }),
                    AcquirePolicy::Reject => Err(LatchError::AlreadyLatched(active.id.clone())),
                };
            }

            let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
            inner.active = Some(ActiveLatch {
                id: id.clone(),
                mode,
            });
            inner.drained = false;
            LatchTicket {
                id,
                mode,
                created: true,
            }
        };

        info!(
            resource = %self.shared.name,
            latch_id = %ticket.id,
            mode = ?mode,
            held = self.held_count(),
            "Latched resource"
        );

        if let Some(propagator) = propagator
            && let Err(err) = propagator.propagate_latch(&ticket.id).await
        {
            warn!(latch_id = %ticket.id, error = %err, "Cluster propagation failed, releasing latch");
            self.release(&ticket.id);
            return Err(err);
        }

        Ok(ticket)
    }

    pub fn current(&self) -> Option<LatchTicket> {
        self.shared.lock().active.as_ref().map(|active| LatchTicket {
            id: active.id.clone(),
            mode: active.mode,
            created: false,
        })
    }

    pub fn state(&self) -> LatchState {
        let inner = self.shared.lock();
        match (&inner.active, inner.drained) {
            (None, _) => LatchState::Available,
            (Some(_), false) => LatchState::Latched,
            (Some(_), true) => LatchState::Drained,
        }
    }

    /// Number of operations currently holding the resource.
    pub fn held_count(&self) -> usize {
        self.shared.lock().leases.len()
    }

    /// Admits an operation without waiting; `None` while latched.
    pub fn try_lease(&self) -> Option<Lease> {
        let mut inner = self.shared.lock();
        if inner.active.is_some() {
            return None;
        }

        let id = inner.next_lease;
        inner.next_lease += 1;
        let interrupt = CancellationToken::new();
        inner.leases.insert(
            id,
            LeaseEntry {
                interrupt: interrupt.clone(),
                on_force_release: None,
            },
        );

        Some(Lease {
            id,
            shared: self.shared.clone(),
            interrupt,
        })
    }

    /// Admits an operation, waiting for the resource to be unlatched.
    pub async fn lease(&self, cancel: &CancelState) -> Result<Lease, LatchError> {
        loop {
            // Register for the wake-up before looking at the state so an
            // unlatch between the check and the wait is not missed.
            let notified = self.shared.unlatched.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_lease() {
                return Ok(lease);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(LatchError::Canceled(Canceled)),
            }
        }
    }

    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.shared.lock();
                if inner.leases.is_empty() {
                    if inner.active.is_some() {
                        inner.drained = true;
                    }
                    return true;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    resource = %self.shared.name,
                    held = self.held_count(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out draining resource"
                );
                return false;
            }
            sleep(self.shared.timing.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn force_drain(&self, timeout: Duration) -> bool {
        if self.drain(timeout).await {
            return true;
        }

        let interrupted = {
            let inner = self.shared.lock();
            for entry in inner.leases.values() {
                entry.interrupt.cancel();
            }
            inner.leases.len()
        };
        warn!(
            resource = %self.shared.name,
            interrupted,
            "Interrupted operations still holding the resource"
        );

        if self.drain(self.shared.timing.interrupt_grace).await {
            return true;
        }

        let evicted: Vec<(u64, LeaseEntry)> = self.shared.lock().leases.drain().collect();
        for (lease_id, entry) in evicted {
            match entry.on_force_release {
                Some(hook) => {
                    warn!(resource = %self.shared.name, lease_id, "Forcibly rolling back holder");
                    hook().await;
                }
                None => {
                    warn!(resource = %self.shared.name, lease_id, "Evicting holder without release hook");
                }
            }
        }

        let mut inner = self.shared.lock();
        if inner.leases.is_empty() {
            if inner.active.is_some() {
                inner.drained = true;
            }
            true
        } else {
            false
        }
    }

    /// Releases the latch `id` and wakes every waiting operation. Returns
    /// false (and does nothing) if `id` is not the active latch.
    pub async fn unlatch(&self, id: &str) -> bool {
        let Some(released) = self.release(id) else {
            debug!(resource = %self.shared.name, latch_id = %id, "Unlatch ignored, latch not active");
            return false;
        };

        if released.mode == LatchMode::Cluster
            && let Some(propagator) = &self.shared.propagator
            && let Err(err) = propagator.propagate_unlatch(id).await
        {
            warn!(latch_id = %id, error = %err, "Failed to propagate unlatch to the cluster");
        }
        true
    }

    fn release(&self, id: &str) -> Option<ActiveLatch> {
        let released = {
            let mut inner = self.shared.lock();
            match &inner.active {
                Some(active) if active.id == id => {
                    inner.drained = false;
                    inner.active.take()
                }
                _ => None,
            }
        };

        if released.is_some() {
            self.shared.unlatched.notify_waiters();
            info!(resource = %self.shared.name, latch_id = %id, "Unlatched resource");
        }
        released
    }
}

/// Proof that an operation is holding the resource. Dropping it releases
/// the hold.
pub struct Lease {
    id: u64,
    shared: Arc<Shared>,
    interrupt: CancellationToken,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancelled when a force-drain asks holders to stop.
    pub fn interrupted(&self) -> &CancellationToken {
        &self.interrupt
    }

    /// Registers what a force-drain runs if this holder does not stop in
    /// time, typically rolling back its open changeset. The drain completes
    /// only after the hook has finished.
    pub fn on_force_release<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Some(entry) = self.shared.lock().leases.get_mut(&self.id) {
            entry.on_force_release = Some(Box::new(move || Box::pin(hook())));
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.shared.lock().leases.remove(&self.id);
    }
}
