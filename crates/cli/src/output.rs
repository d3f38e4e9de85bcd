use crate::error::CliError;
use engine_core::progress::Progress;
use engine_runtime::execution::backup::BackupSummary;
use model::changelog::ChangelogDocument;
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REFRESH: Duration = Duration::from_millis(500);

/// Prints `read()` whenever it changes until `done` is canceled.
pub fn spawn_progress<F>(read: F, done: CancellationToken) -> JoinHandle<()>
where
    F: Fn() -> Progress + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH);
        let mut last: Option<Progress> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = done.cancelled() => break,
            }
            let progress = read();
            if last.as_ref() != Some(&progress) {
                eprintln!("{progress}");
                last = Some(progress);
            }
        }
    })
}

#[derive(Debug, Serialize)]
pub struct ChangeSetSummary {
    pub id: String,
    pub author: String,
    pub weight: u32,
    pub changes: u64,
}

#[derive(Debug, Serialize)]
pub struct ChangelogSummary {
    pub source: String,
    pub created_at: String,
    pub format_version: u32,
    pub total_changes: u64,
    pub change_sets: Vec<ChangeSetSummary>,
}

impl From<&ChangelogDocument> for ChangelogSummary {
    fn from(doc: &ChangelogDocument) -> Self {
        ChangelogSummary {
            source: doc.source.clone(),
            created_at: doc.created_at.to_rfc3339(),
            format_version: doc.format_version,
            total_changes: doc.total_changes(),
            change_sets: doc
                .change_sets
                .iter()
                .map(|cs| ChangeSetSummary {
                    id: cs.id.clone(),
                    author: cs.author.clone(),
                    weight: cs.weight,
                    changes: cs.change_count,
                })
                .collect(),
        }
    }
}

pub fn print_changelog(doc: &ChangelogDocument, as_json: bool) -> Result<(), CliError> {
    let summary = ChangelogSummary::from(doc);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Changelog of '{}':", summary.source);
    println!("-----------------------------");
    println!("{:<16} {}", "Created", summary.created_at);
    println!("{:<16} {}", "Format", summary.format_version);
    println!("{:<16} {}", "Changes", summary.total_changes);
    println!();
    println!("{:<32} {:>8} {:>10}", "Changeset", "Weight", "Changes");
    for cs in &summary.change_sets {
        println!("{:<32} {:>8} {:>10}", cs.id, cs.weight, cs.changes);
    }
    Ok(())
}

pub fn print_backup_summary(summary: &BackupSummary) {
    println!("Backup written to {}", summary.dir.display());
    println!("-----------------------------");
    println!("{:<16} {}", "Tables", summary.tables);
    println!("{:<16} {}", "Rows", summary.rows);
    println!("{:<16} {}", "Blobs", summary.blobs);
    println!("{:<16} {}", "Changesets", summary.change_sets);
}
