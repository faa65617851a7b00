use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::repair::RepairActionKind;
use crate::schema::SeriesKey;

/// Durable trail entry for one applied repair action.
///
/// `before_state` / `after_state` are keyed by `"<collection>/<document id>"`
/// and hold the full document bodies around the write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairRecord {
    pub record_id: Uuid,
    pub finding_id: String,
    pub series: SeriesKey,
    pub action: RepairActionKind,
    pub before_state: BTreeMap<String, Value>,
    pub after_state: BTreeMap<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RepairJournal {
    path: PathBuf,
}

impl RepairJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append records as JSONL and fsync before returning, so the trail
    /// survives a crash immediately after a committed repair.
    pub async fn append_all(&self, records: &[RepairRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        for record in records {
            let line = serde_json::to_string(record)?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<RepairRecord>> {
        Ok(self.scan()?.records)
    }

    /// Read the journal without modifying it.  Lines that fail to parse are
    /// skipped and reported by line number; the file itself is left as is so
    /// an operator can inspect them in place.
    pub fn scan(&self) -> Result<JournalScan> {
        let mut scan = JournalScan::default();
        if !self.path.exists() {
            return Ok(scan);
        }

        let reader = BufReader::new(File::open(&self.path)?);
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RepairRecord>(&line) {
                Ok(record) => scan.records.push(record),
                Err(err) => {
                    tracing::debug!(line = idx + 1, error = %err, "unreadable journal line");
                    scan.skipped_lines.push(idx + 1);
                }
            }
        }

        if !scan.skipped_lines.is_empty() {
            tracing::warn!(
                skipped = scan.skipped_lines.len(),
                first_line = scan.skipped_lines[0],
                path = %self.path.display(),
                "repair journal has unreadable lines"
            );
        }
        Ok(scan)
    }
}

/// Result of reading the journal: parsed records plus the 1-based numbers of
/// lines that did not parse.
#[derive(Debug, Default)]
pub struct JournalScan {
    pub records: Vec<RepairRecord>,
    pub skipped_lines: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::{RepairJournal, RepairRecord};
    use crate::repair::RepairActionKind;
    use crate::schema::SeriesKey;

    fn make_record(finding: &str) -> RepairRecord {
        let mut before = BTreeMap::new();
        before.insert("slots/s1".to_string(), json!({"status": "completed"}));
        let mut after = BTreeMap::new();
        after.insert("slots/s1".to_string(), json!({"status": "pending"}));
        RepairRecord {
            record_id: Uuid::new_v4(),
            finding_id: finding.to_string(),
            series: SeriesKey::new("c1", "f1"),
            action: RepairActionKind::ResetSlot,
            before_state: before,
            after_state: after,
            recorded_at: Utc::now(),
        }
    }

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("checkin-journal-test-{}.jsonl", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn append_and_load_preserves_order() {
        let path = temp_path();
        let journal = RepairJournal::new(&path);
        journal.append_all(&[make_record("f-1")]).await.unwrap();
        journal
            .append_all(&[make_record("f-2"), make_record("f-3")])
            .await
            .unwrap();
        let records = journal.load().unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.finding_id.as_str()).collect();
        assert_eq!(ids, vec!["f-1", "f-2", "f-3"]);
        assert_eq!(records[0].action, RepairActionKind::ResetSlot);
        assert_eq!(records[0].after_state["slots/s1"]["status"], "pending");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_nonexistent_returns_empty() {
        let journal = RepairJournal::new(temp_path());
        assert!(journal.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_skips_corrupt_lines() {
        let path = temp_path();
        let journal = RepairJournal::new(&path);
        journal.append_all(&[make_record("ok-1")]).await.unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map(|mut f| {
                use std::io::Write;
                writeln!(f, "{{not a record}}").unwrap();
            })
            .unwrap();
        journal.append_all(&[make_record("ok-2")]).await.unwrap();
        let records = journal.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].finding_id, "ok-2");
        assert_eq!(journal.scan().unwrap().skipped_lines, vec![2]);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn repeated_loads_leave_the_journal_untouched() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = RepairJournal::new(&path);
        journal.append_all(&[make_record("ok-1")]).await.unwrap();
        let valid = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, format!("{valid}{{broken\n")).unwrap();
        let before = std::fs::read(&path).unwrap();

        for _ in 0..3 {
            let scan = journal.scan().unwrap();
            assert_eq!(scan.records.len(), 1);
            assert_eq!(scan.skipped_lines, vec![2]);
        }
        assert_eq!(std::fs::read(&path).unwrap(), before);
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn empty_append_does_not_create_file() {
        let path = temp_path();
        let journal = RepairJournal::new(&path);
        journal.append_all(&[]).await.unwrap();
        assert!(!path.exists());
    }
}
