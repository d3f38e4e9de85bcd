//! The portable changelog a backup produces and a restore consumes.
//!
//! A backup directory holds [`CHANGELOG_FILE`] plus a [`BLOB_DIR`] of
//! content-addressed binary values referenced from the changelog.

use crate::core::{data_type::DataType, value::FieldValue, value::Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt};
use thiserror::Error;

pub mod weights;

pub const CHANGELOG_FILE: &str = "changelog.json";
pub const BLOB_DIR: &str = "blobs";
pub const FORMAT_VERSION: u32 = 1;

/// Weight budget a full changelog is apportioned over.
pub const TOTAL_WEIGHT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "nullable_default")]
    pub nullable: bool,
}

fn nullable_default() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        ColumnDef {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        TableSchema {
            name: name.into(),
            columns,
            primary_key: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Column used to walk the table in a stable order.
    pub fn sort_column(&self) -> Option<&str> {
        self.primary_key
            .first()
            .or_else(|| self.columns.first().map(|c| &c.name))
            .map(String::as_str)
    }
}

/// A column value as stored in the changelog: inline, or a reference
/// to a blob file written next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredValue {
    Inline { value: Value },
    Blob { id: String, len: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredField {
    pub name: String,
    #[serde(flatten)]
    pub value: StoredValue,
}

impl StoredField {
    pub fn inline(name: impl Into<String>, value: Value) -> Self {
        StoredField {
            name: name.into(),
            value: StoredValue::Inline { value },
        }
    }
}

/// One row-level (or schema-level) operation inside a changeset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeEntry {
    CreateTable {
        schema: TableSchema,
    },
    Insert {
        table: String,
        values: Vec<StoredField>,
    },
    Update {
        table: String,
        key: Vec<FieldValue>,
        values: Vec<StoredField>,
    },
    Delete {
        table: String,
        key: Vec<FieldValue>,
    },
    DeleteAll {
        table: String,
    },
}

impl ChangeEntry {
    pub fn table(&self) -> &str {
        match self {
            ChangeEntry::CreateTable { schema } => &schema.name,
            ChangeEntry::Insert { table, .. }
            | ChangeEntry::Update { table, .. }
            | ChangeEntry::Delete { table, .. }
            | ChangeEntry::DeleteAll { table } => table,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: String,
    pub author: String,
    /// Share of the whole restore this changeset accounts for.
    pub weight: u32,
    pub change_count: u64,
    pub changes: Vec<ChangeEntry>,
}

impl ChangeSet {
    pub fn new(id: impl Into<String>, author: impl Into<String>, changes: Vec<ChangeEntry>) -> Self {
        ChangeSet {
            id: id.into(),
            author: author.into(),
            weight: 0,
            change_count: changes.len() as u64,
            changes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogDocument {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    /// Redacted description of the database the backup was taken from.
    pub source: String,
    pub change_sets: Vec<ChangeSet>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangelogError {
    #[error("Unsupported changelog format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Duplicate changeset id '{0}'")]
    DuplicateChangeSet(String),

    #[error("Changeset '{id}' declares {declared} changes but contains {actual}")]
    ChangeCountMismatch {
        id: String,
        declared: u64,
        actual: u64,
    },
}

impl ChangelogDocument {
    pub fn new(source: impl Into<String>, change_sets: Vec<ChangeSet>) -> Self {
        ChangelogDocument {
            format_version: FORMAT_VERSION,
            created_at: Utc::now(),
            source: source.into(),
            change_sets,
        }
    }

    pub fn total_changes(&self) -> u64 {
        self.change_sets.iter().map(|cs| cs.change_count).sum()
    }

    pub fn total_weight(&self) -> u64 {
        self.change_sets.iter().map(|cs| u64::from(cs.weight)).sum()
    }

    pub fn validate(&self) -> Result<(), ChangelogError> {
        if self.format_version != FORMAT_VERSION {
            return Err(ChangelogError::UnsupportedVersion {
                found: self.format_version,
                expected: FORMAT_VERSION,
            });
        }

        let mut seen = HashSet::new();
        for cs in &self.change_sets {
            if !seen.insert(cs.id.as_str()) {
                return Err(ChangelogError::DuplicateChangeSet(cs.id.clone()));
            }
            let actual = cs.changes.len() as u64;
            if actual != cs.change_count {
                return Err(ChangelogError::ChangeCountMismatch {
                    id: cs.id.clone(),
                    declared: cs.change_count,
                    actual,
                });
            }
        }
        Ok(())
    }
}

// Row-level changes handed to an accessor, with blob references resolved.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertChange {
    pub table: String,
    pub values: Vec<FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateChange {
    pub table: String,
    pub key: Vec<FieldValue>,
    pub values: Vec<FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteChange {
    pub table: String,
    pub key: Vec<FieldValue>,
}

fn fmt_fields(f: &mut fmt::Formatter<'_>, fields: &[FieldValue]) -> fmt::Result {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}={}", field.name, field.value)?;
    }
    Ok(())
}

impl fmt::Display for InsertChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "insert into {} (", self.table)?;
        fmt_fields(f, &self.values)?;
        f.write_str(")")
    }
}

impl fmt::Display for UpdateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "update {} where (", self.table)?;
        fmt_fields(f, &self.key)?;
        f.write_str(")")
    }
}

impl fmt::Display for DeleteChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delete from {} where (", self.table)?;
        fmt_fields(f, &self.key)?;
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_set() -> ChangeSet {
        ChangeSet::new(
            "data:users",
            "stratum",
            vec![ChangeEntry::Insert {
                table: "users".into(),
                values: vec![StoredField::inline("id", Value::Int(1))],
            }],
        )
    }

    #[test]
    fn validates_change_counts() {
        let mut cs = users_set();
        cs.change_count = 3;
        let doc = ChangelogDocument::new("memory://a", vec![cs]);
        assert_eq!(
            doc.validate(),
            Err(ChangelogError::ChangeCountMismatch {
                id: "data:users".into(),
                declared: 3,
                actual: 1
            })
        );
    }

    #[test]
    fn rejects_duplicate_ids() {
        let doc = ChangelogDocument::new("memory://a", vec![users_set(), users_set()]);
        assert_eq!(
            doc.validate(),
            Err(ChangelogError::DuplicateChangeSet("data:users".into()))
        );
    }

    #[test]
    fn serializes_blob_references_flat() {
        let field = StoredField {
            name: "avatar".into(),
            value: StoredValue::Blob {
                id: "abc".into(),
                len: 4,
            },
        };
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["name"], "avatar");
        assert_eq!(json["kind"], "blob");
        assert_eq!(json["id"], "abc");
    }

    #[test]
    fn sort_column_prefers_primary_key() {
        let schema = TableSchema::new(
            "users",
            vec![
                ColumnDef::new("name", DataType::String),
                ColumnDef::new("id", DataType::Int).not_null(),
            ],
        );
        assert_eq!(schema.sort_column(), Some("name"));
        assert_eq!(schema.with_primary_key(&["id"]).sort_column(), Some("id"));
    }
}
