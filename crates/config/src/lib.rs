use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Series materialization ────────────────────────────────────────────────────

/// Controls how many slots `create-series` writes up front.
///
/// | Mode      | Behaviour                                                      |
/// |-----------|----------------------------------------------------------------|
/// | `full`    | Every planned slot is written when the series is created.      |
/// | `rolling` | Only slot 1 is written; slot N+1 is created when N completes.  |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterializeMode {
    #[default]
    Full,
    Rolling,
}

/// Default check-in window, expressed relative to a slot's due date.
///
/// Offsets are whole days from the due date; times are `HH:MM` in the
/// schedule timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub start_day_offset: i64,
    pub start_time: String,
    pub end_day_offset: i64,
    pub end_time: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            start_day_offset: -1,
            start_time: "00:00".to_string(),
            end_day_offset: 2,
            end_time: "23:59".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Due time applied when enrollment omits one, and the time-of-day every
    /// aligned slot is normalized to.
    pub default_due_time: String,
    /// IANA timezone name (e.g. `"Europe/London"`).  Dates are combined with
    /// times in this zone and stored as UTC instants.  Falls back to UTC when
    /// the name is unrecognised.
    pub timezone: String,
    pub materialize: MaterializeMode,
    pub window: WindowConfig,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            default_due_time: "09:00".to_string(),
            timezone: "UTC".to_string(),
            materialize: MaterializeMode::Full,
            window: WindowConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `redb` (embedded file) or `memory` (ephemeral, for dry experiments).
    pub backend: String,
    pub path: String,
    /// Maximum operations per `batch_write` call.  Alignment and series
    /// creation chunk their writes to this size.
    pub max_batch_ops: usize,
    /// How many times a transient write failure is retried before it is
    /// surfaced.  `0` disables retries.
    pub max_write_retries: u32,
    /// Linear backoff step between retries.
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "redb".to_string(),
            path: ".checkin/store.redb".to_string(),
            max_batch_ops: 500,
            max_write_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Append-only JSONL file receiving one record per applied repair.
    pub journal_path: String,
    /// Upper bound on clients repaired concurrently during a system-wide run.
    pub max_parallel_clients: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            journal_path: ".checkin/repair-journal.jsonl".to_string(),
            max_parallel_clients: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AlignConfig {
    /// Slots per write chunk.  `0` means "use the store's batch limit"; larger
    /// values are clamped to that limit.
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub schedule: ScheduleConfig,
    pub storage: StorageConfig,
    pub repair: RepairConfig,
    pub align: AlignConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("CHECKIN_STORE_PATH") {
            if !value.is_empty() {
                config.storage.path = value;
            }
        }

        if let Ok(value) = env::var("CHECKIN_JOURNAL_PATH") {
            if !value.is_empty() {
                config.repair.journal_path = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Effective alignment chunk size given the store's own batch limit.
    pub fn align_chunk_size(&self, store_limit: usize) -> usize {
        let limit = store_limit.max(1);
        match self.align.chunk_size {
            0 => limit,
            n => n.min(limit),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn schedule_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.schedule.default_due_time, "09:00");
        assert_eq!(cfg.schedule.timezone, "UTC");
        assert_eq!(cfg.schedule.materialize, MaterializeMode::Full);
        assert_eq!(cfg.schedule.window.start_day_offset, -1);
        assert_eq!(cfg.schedule.window.end_day_offset, 2);
        assert_eq!(cfg.schedule.window.end_time, "23:59");
    }

    #[test]
    fn storage_and_repair_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.storage.backend, "redb");
        assert_eq!(cfg.storage.max_batch_ops, 500);
        assert_eq!(cfg.storage.max_write_retries, 3);
        assert_eq!(cfg.repair.max_parallel_clients, 4);
        assert_eq!(cfg.align.chunk_size, 0);
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.schedule.default_due_time, "09:00");
        assert_eq!(cfg.storage.backend, "redb");
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[schedule]
default_due_time = "07:30"
timezone = "Europe/London"
materialize = "rolling"

[schedule.window]
start_day_offset = 0
start_time = "06:00"

[storage]
backend = "memory"
max_batch_ops = 20

[align]
chunk_size = 5
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.schedule.default_due_time, "07:30");
        assert_eq!(cfg.schedule.timezone, "Europe/London");
        assert_eq!(cfg.schedule.materialize, MaterializeMode::Rolling);
        assert_eq!(cfg.schedule.window.start_day_offset, 0);
        assert_eq!(cfg.schedule.window.start_time, "06:00");
        // Unspecified window fields keep their defaults
        assert_eq!(cfg.schedule.window.end_day_offset, 2);
        assert_eq!(cfg.storage.backend, "memory");
        assert_eq!(cfg.storage.max_batch_ops, 20);
        assert_eq!(cfg.align.chunk_size, 5);
        assert_eq!(cfg.repair.max_parallel_clients, 4);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/checkin.toml");

        let mut cfg = AppConfig::default();
        cfg.schedule.default_due_time = "18:00".to_string();
        cfg.schedule.materialize = MaterializeMode::Rolling;
        cfg.repair.journal_path = "/var/lib/checkin/journal.jsonl".to_string();

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.schedule.default_due_time, "18:00");
        assert_eq!(loaded.schedule.materialize, MaterializeMode::Rolling);
        assert_eq!(loaded.repair.journal_path, "/var/lib/checkin/journal.jsonl");
    }

    #[test]
    fn materialize_mode_serde() {
        for (mode, label) in [
            (MaterializeMode::Full, "\"full\""),
            (MaterializeMode::Rolling, "\"rolling\""),
        ] {
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, label);
            let back: MaterializeMode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, mode);
        }
    }

    #[test]
    fn align_chunk_size_clamps_to_store_limit() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.align_chunk_size(500), 500);
        cfg.align.chunk_size = 25;
        assert_eq!(cfg.align_chunk_size(500), 25);
        assert_eq!(cfg.align_chunk_size(10), 10);
        assert_eq!(cfg.align_chunk_size(0), 1);
    }

    // ── Env var overrides ──────────────────────────────────────────────────

    #[test]
    fn env_store_path_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(
            &path,
            r#"
[storage]
path = "from-file.redb"
"#,
        )
        .unwrap();

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("CHECKIN_STORE_PATH", "from-env.redb") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.storage.path, "from-env.redb");
        unsafe { env::remove_var("CHECKIN_STORE_PATH") };
    }
}
