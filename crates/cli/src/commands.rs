use crate::conn::DataSourceArg;
use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Export a database into a changelog directory
    Backup {
        #[arg(long, help = "Database to back up, e.g. sled:///var/lib/app/db")]
        from: DataSourceArg,

        #[arg(long, help = "Directory the changelog and blobs are written to")]
        out: PathBuf,

        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Apply a changelog directory to a database
    Restore {
        #[arg(long, help = "Database the changelog is applied to")]
        to: DataSourceArg,

        #[arg(long, help = "Directory holding changelog.json")]
        input: PathBuf,
    },
    /// Move the application from one database to another
    Migrate {
        #[arg(long, help = "Database currently in use")]
        from: DataSourceArg,

        #[arg(long, help = "Database to switch to")]
        to: DataSourceArg,

        #[arg(long, help = "Directory for the intermediate backup")]
        backup_dir: PathBuf,

        #[arg(
            long,
            help = "Configuration store path (defaults to ~/.stratum/config)"
        )]
        state: Option<PathBuf>,

        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Summarize a changelog directory without applying it
    Inspect {
        #[arg(long, help = "Directory holding changelog.json")]
        input: PathBuf,

        #[arg(
            long,
            help = "If set, prints the summary as JSON instead of a table"
        )]
        json: bool,
    },
}

#[derive(Args, Clone, Default)]
pub struct SettingsArgs {
    #[arg(long, help = "JSON settings file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Additional .env file with STRATUM_* overrides")]
    pub env_file: Option<PathBuf>,
}
