//! Modification records and their append-only log.
//!
//! A record is written once when its commit exists. Outcome changes
//! (restart-pending → applied / reverted) are appended as separate status
//! lines and folded in on load, so no line is ever rewritten.

use chrono::{DateTime, Utc};
use ouroboros_core::error::ModificationError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationOutcome {
    /// Live without a restart, or confirmed by a healthy restart
    Applied,
    /// Committed source change waiting for a restart
    RestartPending,
    /// Undone by a rollback
    Reverted,
}

impl std::fmt::Display for ModificationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Applied => "applied",
            Self::RestartPending => "restart-pending",
            Self::Reverted => "reverted",
        })
    }
}

/// One self-modification event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub id: String,
    /// Path relative to the project root
    pub path: String,
    /// `None` when the file did not exist before
    pub old_digest: Option<String>,
    pub new_digest: String,
    pub commit: String,
    pub previous_commit: String,
    pub outcome: ModificationOutcome,
    pub created_at: DateTime<Utc>,
}

impl ModificationRecord {
    pub fn short_commit(&self) -> &str {
        &self.commit[..self.commit.len().min(10)]
    }
}

/// Hex SHA-256 of `content`.
pub fn digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LogLine {
    Created {
        record: ModificationRecord,
    },
    Status {
        id: String,
        outcome: ModificationOutcome,
        at: DateTime<Utc>,
    },
}

/// JSONL-backed store of modification records.
pub struct ModificationLog {
    path: Option<PathBuf>,
    records: RwLock<Vec<ModificationRecord>>,
}

impl ModificationLog {
    /// Open the log at `path`, folding existing lines.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = Self::load_from_disk(&path);
        debug!(path = %path.display(), count = records.len(), "Modification log loaded");
        Self {
            path: Some(path),
            records: RwLock::new(records),
        }
    }

    /// A log that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: RwLock::new(Vec::new()),
        }
    }

    fn load_from_disk(path: &Path) -> Vec<ModificationRecord> {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Vec::new();
        };

        let mut records: Vec<ModificationRecord> = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<LogLine>(line) {
                Ok(LogLine::Created { record }) => records.push(record),
                Ok(LogLine::Status { id, outcome, .. }) => {
                    if let Some(record) = records.iter_mut().find(|r| r.id == id) {
                        record.outcome = outcome;
                    }
                }
                Err(e) => warn!(error = %e, "Skipping corrupted modification log line"),
            }
        }
        records
    }

    fn append_lines(&self, lines: &[LogLine]) -> Result<(), ModificationError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_error = |e: std::io::Error| ModificationError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let mut buf = String::new();
        for line in lines {
            let json = serde_json::to_string(line).map_err(|e| ModificationError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            buf.push_str(&json);
            buf.push('\n');
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_error)?;
        file.write_all(buf.as_bytes()).map_err(io_error)?;
        file.sync_data().map_err(io_error)
    }

    /// Durably append a new record.
    pub async fn append(&self, record: ModificationRecord) -> Result<(), ModificationError> {
        let mut records = self.records.write().await;
        self.append_lines(&[LogLine::Created {
            record: record.clone(),
        }])?;
        records.push(record);
        Ok(())
    }

    /// Durably change the outcome of the given records.
    pub async fn set_outcome(
        &self,
        ids: &[String],
        outcome: ModificationOutcome,
    ) -> Result<(), ModificationError> {
        let mut records = self.records.write().await;
        let now = Utc::now();
        let lines: Vec<LogLine> = ids
            .iter()
            .filter(|id| records.iter().any(|r| &r.id == *id && r.outcome != outcome))
            .map(|id| LogLine::Status {
                id: id.clone(),
                outcome,
                at: now,
            })
            .collect();
        if lines.is_empty() {
            return Ok(());
        }
        self.append_lines(&lines)?;
        for record in records.iter_mut().filter(|r| ids.contains(&r.id)) {
            record.outcome = outcome;
        }
        Ok(())
    }

    pub async fn all(&self) -> Vec<ModificationRecord> {
        self.records.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<ModificationRecord> {
        self.records.read().await.iter().find(|r| r.id == id).cloned()
    }

    /// Records still waiting for a restart, oldest first.
    pub async fn pending(&self) -> Vec<ModificationRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.outcome == ModificationOutcome::RestartPending)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, outcome: ModificationOutcome) -> ModificationRecord {
        ModificationRecord {
            id: id.into(),
            path: "src/lib.rs".into(),
            old_digest: None,
            new_digest: digest(b"new"),
            commit: "abcdef0123456789".into(),
            previous_commit: "0000000".into(),
            outcome,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn status_updates_fold_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modifications.jsonl");
        let log = ModificationLog::open(&path);
        log.append(record("m1", ModificationOutcome::RestartPending)).await.unwrap();
        log.append(record("m2", ModificationOutcome::Applied)).await.unwrap();
        log.set_outcome(&["m1".into()], ModificationOutcome::Reverted)
            .await
            .unwrap();
        assert!(log.pending().await.is_empty());

        let reopened = ModificationLog::open(&path);
        let all = reopened.all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].outcome, ModificationOutcome::Reverted);
        assert_eq!(all[1].outcome, ModificationOutcome::Applied);

        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 3);
    }

    #[tokio::test]
    async fn corrupted_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modifications.jsonl");
        let log = ModificationLog::open(&path);
        log.append(record("m1", ModificationOutcome::RestartPending)).await.unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{not json\n")
            .unwrap();
        let reopened = ModificationLog::open(&path);
        assert_eq!(reopened.pending().await.len(), 1);
        assert_eq!(record("x", ModificationOutcome::Applied).short_commit(), "abcdef0123");
        assert_eq!(ModificationOutcome::RestartPending.to_string(), "restart-pending");
    }
}
