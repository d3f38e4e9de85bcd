use crate::error::StepError;
use async_trait::async_trait;
use engine_core::progress::Progress;

/// A unit of work with its own 0-100 progress.
///
/// `progress` and `cancel` may be called from other tasks while `run` is in
/// flight. After `cancel`, `run` must return promptly with a cancellation.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), StepError>;

    fn progress(&self) -> Progress;

    fn cancel(&self);
}
