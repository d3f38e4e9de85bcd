use crate::error::SettingsError;
use engine_core::latch::AcquirePolicy;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, str::FromStr};
use tracing::{debug, info};

pub mod backup;
pub mod latch;
pub mod phase;

pub use backup::BackupSettings;
pub use latch::LatchSettings;
pub use phase::PhaseWeights;

pub const ENV_DRAIN_TIMEOUT_MS: &str = "STRATUM_DRAIN_TIMEOUT_MS";
pub const ENV_FORCE_DRAIN_TIMEOUT_MS: &str = "STRATUM_FORCE_DRAIN_TIMEOUT_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "STRATUM_DRAIN_POLL_MS";
pub const ENV_INTERRUPT_GRACE_MS: &str = "STRATUM_INTERRUPT_GRACE_MS";
pub const ENV_LATCH_POLICY: &str = "STRATUM_LATCH_POLICY";
pub const ENV_BACKUP_EXCLUDE: &str = "STRATUM_BACKUP_EXCLUDE";
pub const ENV_BLOB_THRESHOLD_BYTES: &str = "STRATUM_BLOB_THRESHOLD_BYTES";

/// Operational settings of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    pub latch: LatchSettings,
    pub phases: PhaseWeights,
    pub backup: BackupSettings,
}

impl MigrationSettings {
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let settings: MigrationSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_json(&json)?;
        info!(path = %path.display(), "Loaded migration settings");
        Ok(settings)
    }

    /// Applies `STRATUM_*` overrides found in `vars`.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> Result<(), SettingsError> {
        if let Some(v) = parse_var(vars, ENV_DRAIN_TIMEOUT_MS)? {
            self.latch.drain_timeout_ms = v;
        }
        if let Some(v) = parse_var(vars, ENV_FORCE_DRAIN_TIMEOUT_MS)? {
            self.latch.force_drain_timeout_ms = v;
        }
        if let Some(v) = parse_var(vars, ENV_POLL_INTERVAL_MS)? {
            self.latch.poll_interval_ms = v;
        }
        if let Some(v) = parse_var(vars, ENV_INTERRUPT_GRACE_MS)? {
            self.latch.interrupt_grace_ms = v;
        }
        if let Some(v) = parse_var(vars, ENV_BLOB_THRESHOLD_BYTES)? {
            self.backup.blob_threshold_bytes = v;
        }
        if let Some(raw) = vars.get(ENV_LATCH_POLICY) {
            self.latch.policy = parse_policy(raw)?;
            debug!(key = ENV_LATCH_POLICY, value = %raw, "Applied environment override");
        }
        if let Some(raw) = vars.get(ENV_BACKUP_EXCLUDE) {
            self.backup.excluded_tables = raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            debug!(key = ENV_BACKUP_EXCLUDE, value = %raw, "Applied environment override");
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.latch.poll_interval_ms == 0 {
            return Err(SettingsError::Invalid(
                "latch.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.phases.total() == 0 {
            return Err(SettingsError::Invalid(
                "at least one phase weight must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>, SettingsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = vars.get(key) else {
        return Ok(None);
    };
    let value = raw
        .trim()
        .parse::<T>()
        .map_err(|e| SettingsError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })?;
    debug!(key, value = %raw, "Applied environment override");
    Ok(Some(value))
}

fn parse_policy(raw: &str) -> Result<AcquirePolicy, SettingsError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "reject" => Ok(AcquirePolicy::Reject),
        "return_existing" | "reuse" => Ok(AcquirePolicy::ReturnExisting),
        _ => Err(SettingsError::InvalidValue {
            key: ENV_LATCH_POLICY.to_string(),
            value: raw.to_string(),
            reason: "expected 'reject' or 'return_existing'".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings =
            MigrationSettings::from_json(r#"{ "latch": { "drain_timeout_ms": 500 } }"#).unwrap();
        assert_eq!(settings.latch.drain_timeout(), Duration::from_millis(500));
        assert_eq!(settings.latch.force_drain_timeout_ms, 10_000);
        assert_eq!(settings.phases, PhaseWeights::default());
        assert_eq!(settings.phases.total(), 100);
    }

    #[test]
    fn env_overrides_apply() {
        let mut settings = MigrationSettings::default();
        settings
            .apply_env(&vars(&[
                (ENV_POLL_INTERVAL_MS, "25"),
                (ENV_LATCH_POLICY, "return_existing"),
                (ENV_BACKUP_EXCLUDE, "audit_log, sessions,"),
            ]))
            .unwrap();

        assert_eq!(
            settings.latch.drain_timing().poll_interval,
            Duration::from_millis(25)
        );
        assert_eq!(settings.latch.policy, AcquirePolicy::ReturnExisting);
        assert_eq!(settings.backup.excluded_tables, vec!["audit_log", "sessions"]);
        assert!(settings.backup.is_excluded("SESSIONS"));
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut settings = MigrationSettings::default();
        let err = settings
            .apply_env(&vars(&[(ENV_DRAIN_TIMEOUT_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue { ref key, .. } if key == ENV_DRAIN_TIMEOUT_MS));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err =
            MigrationSettings::from_json(r#"{ "latch": { "poll_interval_ms": 0 } }"#).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "backup": { "blob_threshold_bytes": 16 } }"#).unwrap();

        let settings = MigrationSettings::load(&path).unwrap();
        assert_eq!(settings.backup.blob_threshold_bytes, 16);
        assert!(matches!(
            MigrationSettings::load(dir.path().join("missing.json")),
            Err(SettingsError::Read { .. })
        ));
    }
}
