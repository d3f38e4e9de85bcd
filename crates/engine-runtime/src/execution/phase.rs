use crate::{error::StepError, execution::step::Step};
use async_trait::async_trait;
use engine_core::progress::Progress;
use model::cancel::{self, CancelState};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU8, Ordering},
};
use tracing::{info, warn};

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

struct WeightedStep {
    step: Arc<dyn Step>,
    weight: u32,
    status: AtomicU8,
}

/// Ordered steps, each owning a relative share of the phase's progress.
///
/// Steps run strictly in the order they were added. The first error stops
/// the phase and is returned untouched; undoing earlier steps is up to the
/// owner of the phase.
pub struct Phase {
    name: String,
    message_key: String,
    steps: Vec<WeightedStep>,
    cancel: CancelState,
    ran: AtomicBool,
}

pub struct PhaseBuilder {
    name: String,
    message_key: String,
    steps: Vec<WeightedStep>,
    cancel: CancelState,
}

impl PhaseBuilder {
    pub fn step(mut self, step: Arc<dyn Step>, weight: u32) -> Self {
        self.steps.push(WeightedStep {
            step,
            weight,
            status: AtomicU8::new(PENDING),
        });
        self
    }

    pub fn build(self) -> Phase {
        Phase {
            name: self.name,
            message_key: self.message_key,
            steps: self.steps,
            cancel: self.cancel,
            ran: AtomicBool::new(false),
        }
    }
}

impl Phase {
    /// `cancel` is checked before every step and cancelled by
    /// [`Step::cancel`].
    pub fn builder(
        name: impl Into<String>,
        message_key: impl Into<String>,
        cancel: CancelState,
    ) -> PhaseBuilder {
        PhaseBuilder {
            name: name.into(),
            message_key: message_key.into(),
            steps: Vec::new(),
            cancel,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl Step for Phase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<(), StepError> {
        if self.ran.swap(true, Ordering::AcqRel) {
            return Err(StepError::AlreadyRan(self.name.clone()));
        }

        let total = self.steps.len();
        for (idx, entry) in self.steps.iter().enumerate() {
            if let Err(canceled) = cancel::check(&self.cancel) {
                warn!(
                    phase = %self.name,
                    step = entry.step.name(),
                    "Canceled before step {}/{}",
                    idx + 1,
                    total
                );
                return Err(canceled.into());
            }

            info!(
                phase = %self.name,
                step = entry.step.name(),
                weight = entry.weight,
                "Running step {}/{}",
                idx + 1,
                total
            );
            entry.status.store(RUNNING, Ordering::Release);
            entry.step.run().await?;
            entry.status.store(DONE, Ordering::Release);
        }

        info!(phase = %self.name, "Phase completed");
        Ok(())
    }

    fn progress(&self) -> Progress {
        let total_weight: u64 = self.steps.iter().map(|s| u64::from(s.weight)).sum();
        let mut weighted = 0u64;
        let mut all_done = true;
        let mut current: Option<Progress> = None;

        for entry in &self.steps {
            match entry.status.load(Ordering::Acquire) {
                DONE => weighted += u64::from(entry.weight) * 100,
                RUNNING => {
                    all_done = false;
                    let progress = entry.step.progress();
                    weighted += u64::from(entry.weight) * u64::from(progress.percent);
                    current = Some(progress);
                }
                _ => all_done = false,
            }
        }
        let message_key = current
            .map(|p| p.message_key)
            .unwrap_or_else(|| self.message_key.clone());

        let percent = if total_weight == 0 {
            if all_done { 100 } else { 0 }
        } else {
            weighted / total_weight
        };
        Progress::new(message_key, percent)
    }

    fn cancel(&self) {
        self.cancel.cancel();
        for entry in &self.steps {
            entry.step.cancel();
        }
    }
}
