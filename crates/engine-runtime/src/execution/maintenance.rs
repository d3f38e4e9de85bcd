use crate::{
    error::StepError,
    execution::{KEY_MAINTENANCE, step::Step},
};
use async_trait::async_trait;
use engine_core::{database::DatabaseLatch, progress::Progress};
use model::cancel::{CancelState, Canceled};
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};
use tracing::{info, warn};

/// Puts the database into maintenance mode: with the latch already held,
/// waits for in-flight operations to finish.
///
/// A reused latch belongs to whoever created it, so draining is left to them.
pub struct MaintenanceStep {
    latch: Arc<dyn DatabaseLatch>,
    owns_latch: bool,
    drain_timeout: Duration,
    force_drain_timeout: Duration,
    cancel: CancelState,
    percent: AtomicU8,
}

impl MaintenanceStep {
    pub fn new(
        latch: Arc<dyn DatabaseLatch>,
        owns_latch: bool,
        drain_timeout: Duration,
        force_drain_timeout: Duration,
        cancel: CancelState,
    ) -> Self {
        MaintenanceStep {
            latch,
            owns_latch,
            drain_timeout,
            force_drain_timeout,
            cancel,
            percent: AtomicU8::new(0),
        }
    }

    async fn until_canceled<T>(&self, work: impl Future<Output = T>) -> Result<T, Canceled> {
        tokio::select! {
            value = work => Ok(value),
            _ = self.cancel.cancelled() => Err(Canceled),
        }
    }
}

#[async_trait]
impl Step for MaintenanceStep {
    fn name(&self) -> &str {
        "maintenance"
    }

    async fn run(&self) -> Result<(), StepError> {
        if !self.owns_latch {
            info!(latch_id = self.latch.id(), "Latch was reused, leaving drain to its owner");
            self.percent.store(100, Ordering::Release);
            return Ok(());
        }

        let drained = self
            .until_canceled(self.latch.drain(self.drain_timeout))
            .await?;
        self.percent.store(50, Ordering::Release);

        if !drained {
            warn!(
                latch_id = self.latch.id(),
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Drain timed out, forcing"
            );
            let forced = self
                .until_canceled(self.latch.force_drain(self.force_drain_timeout))
                .await?;
            if !forced {
                return Err(StepError::DrainTimeout(
                    self.drain_timeout + self.force_drain_timeout,
                ));
            }
        }

        info!(latch_id = self.latch.id(), "Database is in maintenance mode");
        self.percent.store(100, Ordering::Release);
        Ok(())
    }

    fn progress(&self) -> Progress {
        Progress::new(
            KEY_MAINTENANCE,
            u64::from(self.percent.load(Ordering::Acquire)),
        )
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
