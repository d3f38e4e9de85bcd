use crate::{
    commands::{Commands, SettingsArgs},
    env::EnvManager,
    error::CliError,
    shutdown::{ExitCode, ShutdownCoordinator},
};
use clap::Parser;
use connectors::handle::DatabaseHandle;
use engine_config::settings::MigrationSettings;
use engine_core::{
    database::DefaultDatabaseManager,
    event_bus::EventBus,
    latch::LatchController,
    state::SledConfigurationStore,
};
use engine_runtime::execution::{
    MigrationTask, MigrationTaskParams, Step,
    backup::BackupState,
    restore::{RestoreState, load_changelog},
    standalone::{backup_task, restore_task},
};
use model::{
    cancel::is_cancellation, datasource::DataSourceConfiguration,
    events::migration::MigrationFailed,
};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod commands;
mod conn;
mod env;
mod error;
mod output;
mod shutdown;

#[derive(Parser)]
#[command(
    name = "stratum",
    version = "0.0.1",
    about = "Database backup, restore and live migration"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let shutdown = ShutdownCoordinator::new(CancellationToken::new());
    shutdown.register_handlers();

    let code = match run(cli.command, &shutdown).await {
        Ok(()) => ExitCode::Success,
        Err(err) if shutdown.is_shutdown_requested() || is_cancellation(&err) => {
            error!(error = %err, "Stopped on request");
            ExitCode::ShutdownRequested
        }
        Err(err) => {
            error!(error = %err, "Command failed");
            eprintln!("Error: {err}");
            ExitCode::GeneralError
        }
    };
    std::process::exit(code.as_i32());
}

async fn run(command: Commands, shutdown: &ShutdownCoordinator) -> Result<(), CliError> {
    match command {
        Commands::Backup { from, out, settings } => {
            let settings = load_settings(&settings)?;
            let source = DatabaseHandle::connect(from.into_config())?;
            let (phase, step) = backup_task(
                BackupState {
                    source: source.clone(),
                    dir: out,
                    settings: settings.backup,
                },
                shutdown.cancel_token().child_token(),
            );

            run_with_progress(Arc::new(phase)).await?;
            source.close().await?;
            if let Some(summary) = step.summary() {
                output::print_backup_summary(&summary);
            }
        }
        Commands::Restore { to, input } => {
            let target = DatabaseHandle::connect(to.into_config())?;
            let phase = restore_task(
                RestoreState {
                    target: target.clone(),
                    dir: input,
                },
                shutdown.cancel_token().child_token(),
            );

            run_with_progress(Arc::new(phase)).await?;
            target.close().await?;
            println!("Restored into {}", target.describe());
        }
        Commands::Migrate {
            from,
            to,
            backup_dir,
            state,
            settings,
        } => migrate(from.into_config(), to.into_config(), backup_dir, state, settings, shutdown)
            .await?,
        Commands::Inspect { input, json } => {
            let document = load_changelog(&input).await?;
            output::print_changelog(&document, json)?;
        }
    }

    Ok(())
}

async fn migrate(
    from: DataSourceConfiguration,
    to: DataSourceConfiguration,
    backup_dir: PathBuf,
    state: Option<PathBuf>,
    settings: SettingsArgs,
    shutdown: &ShutdownCoordinator,
) -> Result<(), CliError> {
    let settings = load_settings(&settings)?;
    let source = DatabaseHandle::connect(from)?;
    let target = DatabaseHandle::connect(to)?;

    let controller = LatchController::builder("database")
        .timing(settings.latch.drain_timing())
        .policy(settings.latch.policy)
        .build();
    let manager = Arc::new(DefaultDatabaseManager::new(source, controller));

    let state_path = match state {
        Some(path) => path,
        None => default_state_path()?,
    };
    let config_service = Arc::new(SledConfigurationStore::open(&state_path)?);

    let events = EventBus::new();
    let (failed_tx, mut failed_rx) = mpsc::channel::<Arc<MigrationFailed>>(4);
    events.subscribe(failed_tx).await;

    let task = Arc::new(MigrationTask::new(MigrationTaskParams {
        manager,
        target: target.clone(),
        config_service,
        events: events.clone(),
        settings,
        backup_dir,
    }));
    info!(task_id = task.id(), state = %state_path.display(), "Starting migration");

    let watcher = {
        let task = task.clone();
        let token = shutdown.cancel_token();
        tokio::spawn(async move {
            token.cancelled().await;
            task.cancel();
        })
    };

    let done = CancellationToken::new();
    let printer = {
        let task = task.clone();
        output::spawn_progress(move || task.progress(), done.clone())
    };

    let result = task.run().await;
    done.cancel();
    watcher.abort();
    let _ = printer.await;
    events.terminate().await;

    while let Ok(failed) = failed_rx.try_recv() {
        eprintln!("{failed}");
    }

    result?;
    target.close().await?;
    println!("Switched to {} (task {})", target.describe(), task.id());
    Ok(())
}

/// Runs a standalone phase while its progress is printed.
async fn run_with_progress(step: Arc<dyn Step>) -> Result<(), CliError> {
    let done = CancellationToken::new();
    let printer = {
        let step = step.clone();
        output::spawn_progress(move || step.progress(), done.clone())
    };

    let result = step.run().await;
    done.cancel();
    let _ = printer.await;
    eprintln!("{}", step.progress());
    Ok(result?)
}

fn load_settings(args: &SettingsArgs) -> Result<MigrationSettings, CliError> {
    let mut settings = match &args.config {
        Some(path) => MigrationSettings::load(path)?,
        None => MigrationSettings::default(),
    };

    let mut env = EnvManager::new();
    if let Some(path) = &args.env_file {
        env.load_from_file(path)?;
    }

    let overrides = env.overrides();
    for (key, value) in &overrides {
        debug!(key = %key, value = env.display_value(key, value), "Environment override");
    }
    settings.apply_env(&overrides)?;
    settings.validate()?;
    Ok(settings)
}

fn default_state_path() -> Result<PathBuf, CliError> {
    let home = dirs::home_dir()
        .ok_or_else(|| CliError::Unexpected("Could not determine home directory".into()))?;
    Ok(home.join(".stratum/config"))
}
