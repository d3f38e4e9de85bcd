#[cfg(test)]
mod tests {
    use crate::{
        memory_db, sled_db,
        utils::{
            AUDIT_LOG, DOCUMENTS, USERS, assert_row_count, assert_same_contents, fetch_rows,
            get_table_names, insert, populate_data,
        },
    };
    use connectors::handle::DatabaseHandle;
    use engine_config::settings::BackupSettings;
    use engine_runtime::{
        error::StepError,
        execution::{
            Step,
            backup::{BackupState, BackupSummary},
            restore::{RestoreState, load_changelog},
            standalone::{backup_task, restore_task},
        },
    };
    use model::{
        cancel::{CancelState, is_cancellation},
        changelog::{BLOB_DIR, CHANGELOG_FILE, ChangeEntry, ColumnDef, StoredValue, TableSchema},
        core::{
            data_type::DataType,
            value::{FieldValue, Value},
        },
    };
    use std::path::Path;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    async fn backup(source: &DatabaseHandle, dir: &Path, settings: BackupSettings) -> BackupSummary {
        let (phase, step) = backup_task(
            BackupState {
                source: source.clone(),
                dir: dir.to_path_buf(),
                settings,
            },
            CancelState::new(),
        );
        phase.run().await.expect("backup");
        assert_eq!(phase.progress().percent, 100);
        step.summary().expect("summary after backup")
    }

    async fn restore(target: &DatabaseHandle, dir: &Path) -> Result<(), StepError> {
        let phase = restore_task(
            RestoreState {
                target: target.clone(),
                dir: dir.to_path_buf(),
            },
            CancelState::new(),
        );
        phase.run().await?;
        assert_eq!(phase.progress().percent, 100);
        Ok(())
    }

    // Scenario: back up a populated in-memory database and restore it into an empty one.
    // Expected Outcome: both databases hold identical tables and rows.
    #[traced_test]
    #[tokio::test]
    async fn memory_round_trip() {
        let dir = tempdir().unwrap();
        let source = memory_db("source");
        let target = memory_db("target");
        populate_data(&source, 25, 6).await;

        let summary = backup(&source, dir.path(), BackupSettings::default()).await;
        assert_eq!(summary.tables, 3);
        assert_eq!(summary.rows, 25 + 6 + 1);
        // Even document ids carry 128 KiB bodies, each with a distinct byte.
        assert_eq!(summary.blobs, 3);

        restore(&target, dir.path()).await.unwrap();
        assert_same_contents(&source, &target).await;
        assert!(logs_contain("Restore completed"));
    }

    // Scenario: same round trip on sled, reopening nothing in between.
    // Expected Outcome: data survives JSON row encoding and blob extraction.
    #[traced_test]
    #[tokio::test]
    async fn sled_round_trip() {
        let dbs = tempdir().unwrap();
        let dir = tempdir().unwrap();
        let source = sled_db(dbs.path(), "source");
        let target = sled_db(dbs.path(), "target");
        populate_data(&source, 40, 4).await;

        backup(&source, dir.path(), BackupSettings::default()).await;
        restore(&target, dir.path()).await.unwrap();

        assert_same_contents(&source, &target).await;
        assert_row_count(&target, USERS, 40).await;
    }

    // Scenario: the audit table is excluded from the backup.
    // Expected Outcome: the restored database has no audit table at all.
    #[traced_test]
    #[tokio::test]
    async fn excluded_tables_are_not_restored() {
        let dir = tempdir().unwrap();
        let source = memory_db("source");
        let target = memory_db("target");
        populate_data(&source, 3, 1).await;

        let settings = BackupSettings {
            excluded_tables: vec![AUDIT_LOG.to_string()],
            ..BackupSettings::default()
        };
        let summary = backup(&source, dir.path(), settings).await;
        assert_eq!(summary.tables, 2);

        restore(&target, dir.path()).await.unwrap();
        assert_eq!(
            get_table_names(&target).await,
            vec![DOCUMENTS.to_string(), USERS.to_string()]
        );
        assert!(logs_contain("Table excluded from backup"));
    }

    // Scenario: inspect the written changelog.
    // Expected Outcome: schema first, one changeset per table, weights sum to 100,
    // large bodies referenced by content id.
    #[traced_test]
    #[tokio::test]
    async fn changelog_layout() {
        let dir = tempdir().unwrap();
        let source = memory_db("source");
        populate_data(&source, 10, 2).await;
        backup(&source, dir.path(), BackupSettings::default()).await;

        let doc = load_changelog(dir.path()).await.unwrap();
        let ids: Vec<&str> = doc.change_sets.iter().map(|cs| cs.id.as_str()).collect();
        assert_eq!(ids[0], "schema");
        assert_eq!(ids.len(), 4);
        assert!(ids.contains(&"data:users"));
        assert_eq!(doc.total_weight(), 100);
        assert_eq!(doc.source, "memory://source");

        let documents = doc
            .change_sets
            .iter()
            .find(|cs| cs.id == "data:documents")
            .unwrap();
        let ChangeEntry::Insert { values, .. } = &documents.changes[1] else {
            panic!("expected insert");
        };
        let body = values.iter().find(|f| f.name == "body").unwrap();
        let StoredValue::Blob { id, len } = &body.value else {
            panic!("expected blob reference");
        };
        assert_eq!(*len, 128 * 1024);
        let bytes = std::fs::read(dir.path().join(BLOB_DIR).join(id)).unwrap();
        assert_eq!(blake3::hash(&bytes).to_hex().as_str(), id);
    }

    // Scenario: a blob is replaced on disk between backup and restore.
    // Expected Outcome: restore fails and the failed changeset leaves no rows behind.
    #[traced_test]
    #[tokio::test]
    async fn tampered_blob_fails_restore_cleanly() {
        let dir = tempdir().unwrap();
        let source = memory_db("source");
        let target = memory_db("target");
        populate_data(&source, 2, 2).await;
        backup(&source, dir.path(), BackupSettings::default()).await;

        let blob_dir = dir.path().join(BLOB_DIR);
        let blob = std::fs::read_dir(&blob_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::write(&blob, b"tampered").unwrap();

        let err = restore(&target, dir.path()).await.unwrap_err();
        assert!(matches!(err, StepError::Blob { .. }));
        assert_row_count(&target, DOCUMENTS, 0).await;
        assert!(logs_contain("Rolling back changeset"));
    }

    // Scenario: the backup is canceled before it starts.
    // Expected Outcome: the error is a cancellation and no changelog is written.
    #[traced_test]
    #[tokio::test]
    async fn canceled_backup_leaves_no_changelog() {
        let dir = tempdir().unwrap();
        let source = memory_db("source");
        populate_data(&source, 5, 0).await;

        let cancel = CancelState::new();
        let (phase, _) = backup_task(
            BackupState {
                source,
                dir: dir.path().to_path_buf(),
                settings: BackupSettings::default(),
            },
            cancel.clone(),
        );
        cancel.cancel();

        let err = phase.run().await.unwrap_err();
        assert!(is_cancellation(&err));
        assert!(!dir.path().join(CHANGELOG_FILE).exists());
    }

    // Scenario: restore is pointed at a directory without a changelog.
    // Expected Outcome: an I/O error naming the missing file.
    #[traced_test]
    #[tokio::test]
    async fn restore_without_changelog_fails() {
        let dir = tempdir().unwrap();
        let err = restore(&memory_db("target"), dir.path()).await.unwrap_err();
        assert!(matches!(err, StepError::Io { .. }));
        assert!(err.to_string().contains(CHANGELOG_FILE));
    }

    // Scenario: a sled table holds NaN and both infinities next to ordinary floats.
    // Expected Outcome: the rows survive sled storage, the changelog and restore
    // bit for bit.
    #[traced_test]
    #[tokio::test]
    async fn non_finite_floats_round_trip() {
        let dbs = tempdir().unwrap();
        let dir = tempdir().unwrap();
        let source = sled_db(dbs.path(), "source");
        let target = sled_db(dbs.path(), "target");

        let readings = TableSchema::new(
            "readings",
            vec![
                ColumnDef::new("id", DataType::Int).not_null(),
                ColumnDef::new("reading", DataType::Float),
            ],
        )
        .with_primary_key(&["id"]);
        source.accessor().create_schema(&[readings]).await.unwrap();

        let samples = [1.25, f64::NAN, f64::INFINITY, f64::NEG_INFINITY];
        for (id, reading) in samples.iter().enumerate() {
            insert(
                source.accessor().as_ref(),
                "readings",
                vec![
                    FieldValue::new("id", Value::Int(id as i64)),
                    FieldValue::new("reading", Value::Float(*reading)),
                ],
            )
            .await;
        }

        backup(&source, dir.path(), BackupSettings::default()).await;
        restore(&target, dir.path()).await.unwrap();

        let rows = fetch_rows(&target, "readings").await;
        assert_eq!(rows.len(), samples.len());
        for (row, expected) in rows.iter().zip(samples) {
            let Value::Float(actual) = row.get_value("reading") else {
                panic!("expected a float in {row:?}");
            };
            assert_eq!(actual.to_bits(), expected.to_bits());
        }
    }
}
