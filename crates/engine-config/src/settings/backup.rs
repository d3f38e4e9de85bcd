use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Tables left out of the backup. Matched case-insensitively.
    pub excluded_tables: Vec<String>,
    /// Binary values larger than this are written to the blob directory.
    pub blob_threshold_bytes: usize,
    /// Recorded as the author of every generated changeset.
    pub author: String,
}

impl Default for BackupSettings {
    fn default() -> Self {
        BackupSettings {
            excluded_tables: Vec::new(),
            blob_threshold_bytes: 64 * 1024,
            author: "stratum".to_string(),
        }
    }
}

impl BackupSettings {
    pub fn is_excluded(&self, table: &str) -> bool {
        self.excluded_tables
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table))
    }
}
