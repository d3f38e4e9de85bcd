use crate::{
    error::StepError,
    execution::{KEY_FINALIZE, step::Step},
};
use async_trait::async_trait;
use connectors::handle::DatabaseHandle;
use engine_core::{progress::Progress, state::ConfigurationService};
use model::cancel::{self, CancelState};
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};
use tracing::{info, warn};

/// Commits the target as the active data source, then retires the source.
///
/// Once the configuration is saved the migration is committed: a failure to
/// close the source is logged and does not fail the step.
pub struct FinalizeStep {
    config_service: Arc<dyn ConfigurationService>,
    source: DatabaseHandle,
    target: DatabaseHandle,
    cancel: CancelState,
    percent: AtomicU8,
}

impl FinalizeStep {
    pub fn new(
        config_service: Arc<dyn ConfigurationService>,
        source: DatabaseHandle,
        target: DatabaseHandle,
        cancel: CancelState,
    ) -> Self {
        FinalizeStep {
            config_service,
            source,
            target,
            cancel,
            percent: AtomicU8::new(0),
        }
    }
}

#[async_trait]
impl Step for FinalizeStep {
    fn name(&self) -> &str {
        "finalize"
    }

    async fn run(&self) -> Result<(), StepError> {
        cancel::check(&self.cancel)?;

        self.config_service
            .save_data_source_configuration(self.target.config(), Some(self.source.config()))
            .await?;
        self.percent.store(50, Ordering::Release);
        info!(database = %self.target.describe(), "Target is now the active data source");

        match self.source.close().await {
            Ok(_) => info!(database = %self.source.describe(), "Closed source database"),
            Err(err) => warn!(
                database = %self.source.describe(),
                error = %err,
                "Failed to close source database after switching"
            ),
        }
        self.percent.store(100, Ordering::Release);
        Ok(())
    }

    fn progress(&self) -> Progress {
        Progress::new(KEY_FINALIZE, u64::from(self.percent.load(Ordering::Acquire)))
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
