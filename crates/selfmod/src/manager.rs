//! Self-modification manager: read and write the agent's own source,
//! commit every change, and request restarts.
//!
//! All mutations go through one async lock, so two concurrent writes are
//! committed one after the other and a restart request observes every
//! record written before it. A record is durably logged before the write
//! returns, which is what lets the restart path roll it back.

use crate::git::VersionControl;
use crate::record::{digest, ModificationLog, ModificationOutcome, ModificationRecord};
use crate::state::{transition, ModEvent, ModState};
use chrono::{DateTime, Utc};
use ouroboros_core::error::ModificationError;
use ouroboros_core::journal::{Journal, JournalEntry, JournalKind};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

const DEFAULT_READ_LIMIT: usize = 50_000;
const STRUCTURE_LINE_CAP: usize = 200;
const SKIPPED_DIRS: [&str; 3] = ["target", "node_modules", "__pycache__"];

/// A request to replace the running process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartRequest {
    pub reason: String,
    /// Records that become live (or are reverted) with this restart
    pub record_ids: Vec<String>,
    /// Commit to return to if the successor is unhealthy
    pub last_good_commit: String,
    pub requested_at: DateTime<Utc>,
}

/// Result of a write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Content was identical; nothing written or committed
    Unchanged { path: String },
    Recorded(ModificationRecord),
}

/// Whether a change to `rel` only takes effect after a restart.
pub fn requires_restart(rel: &Path) -> bool {
    let top_level_source = matches!(
        rel.components().next(),
        Some(Component::Normal(first)) if first == "src" || first == "crates"
    );
    let build_file = rel
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| matches!(n, "Cargo.toml" | "Cargo.lock" | "build.rs"));
    let rust_source = rel.extension().is_some_and(|e| e == "rs");
    top_level_source || build_file || rust_source
}

pub struct SelfModManager {
    root: PathBuf,
    vcs: Arc<dyn VersionControl>,
    log: Arc<ModificationLog>,
    journal: Option<Arc<dyn Journal>>,
    state: Mutex<ModState>,
    read_limit: usize,
    restart_tx: watch::Sender<Option<RestartRequest>>,
}

impl SelfModManager {
    /// Pending records in the log put the manager straight into `ChangeStaged`.
    pub async fn new(
        root: impl Into<PathBuf>,
        vcs: Arc<dyn VersionControl>,
        log: Arc<ModificationLog>,
    ) -> Self {
        let root = root.into();
        let root = root.canonicalize().unwrap_or(root);
        let state = if log.pending().await.is_empty() {
            ModState::Running
        } else {
            ModState::ChangeStaged
        };
        let (restart_tx, _) = watch::channel(None);
        Self {
            root,
            vcs,
            log,
            journal: None,
            state: Mutex::new(state),
            read_limit: DEFAULT_READ_LIMIT,
            restart_tx,
        }
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_read_limit(mut self, limit: usize) -> Self {
        self.read_limit = limit;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log(&self) -> &Arc<ModificationLog> {
        &self.log
    }

    pub fn version_control(&self) -> &Arc<dyn VersionControl> {
        &self.vcs
    }

    pub async fn state(&self) -> ModState {
        *self.state.lock().await
    }

    /// Receives every restart request (and `None` when one is aborted).
    pub fn subscribe_restarts(&self) -> watch::Receiver<Option<RestartRequest>> {
        self.restart_tx.subscribe()
    }

    /// Map a project-relative path to (relative, absolute), refusing escapes.
    fn resolve(&self, path: &str) -> Result<(PathBuf, PathBuf), ModificationError> {
        let invalid = || ModificationError::InvalidPath { path: path.into() };
        let rel = Path::new(path.trim());
        if rel.as_os_str().is_empty() || rel.is_absolute() {
            return Err(invalid());
        }

        let mut clean = PathBuf::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) if part == ".git" => return Err(invalid()),
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                _ => return Err(invalid()),
            }
        }
        if clean.as_os_str().is_empty() {
            return Err(invalid());
        }

        let absolute = self.root.join(&clean);
        // Symlinked directories must not lead out of the root.
        let mut ancestor = absolute.parent();
        while let Some(dir) = ancestor {
            if let Ok(canonical) = dir.canonicalize() {
                if !canonical.starts_with(&self.root) {
                    return Err(invalid());
                }
                break;
            }
            ancestor = dir.parent();
        }
        Ok((clean, absolute))
    }

    /// Read a source file, truncated to the read limit.
    pub async fn read_source(&self, path: &str) -> Result<String, ModificationError> {
        let (rel, absolute) = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&absolute)
            .await
            .map_err(|e| ModificationError::Io {
                path: rel.display().to_string(),
                reason: e.to_string(),
            })?;
        if content.len() <= self.read_limit {
            return Ok(content);
        }
        let mut cut = self.read_limit;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        Ok(format!(
            "{}\n... [truncated, {} bytes total]",
            &content[..cut],
            content.len()
        ))
    }

    /// Write a source file and commit it. The record is logged before this
    /// returns; a failed commit restores the previous content.
    pub async fn write_source(
        &self,
        path: &str,
        content: &str,
    ) -> Result<WriteOutcome, ModificationError> {
        let mut state = self.state.lock().await;
        if matches!(*state, ModState::RestartRequested | ModState::ProcessReplaced) {
            return Err(ModificationError::RestartInProgress);
        }

        let (rel, absolute) = self.resolve(path)?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        let io_error = |e: std::io::Error| ModificationError::Io {
            path: rel_str.clone(),
            reason: e.to_string(),
        };

        let previous = match tokio::fs::read(&absolute).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_error(e)),
        };
        let old_digest = previous.as_deref().map(digest);
        let new_digest = digest(content.as_bytes());
        if old_digest.as_deref() == Some(new_digest.as_str()) {
            return Ok(WriteOutcome::Unchanged { path: rel_str.clone() });
        }

        let previous_commit = self.vcs.head().await?;

        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::write(&absolute, content).await.map_err(io_error)?;

        let message = format!("self-modify: update {rel_str}");
        let commit = match self.vcs.commit(std::slice::from_ref(&rel), &message).await {
            Ok(commit) => commit,
            Err(e) => {
                warn!(path = %rel_str, error = %e, "Commit failed, restoring previous content");
                restore(&absolute, previous.as_deref(), &rel_str).await;
                return Err(match e {
                    ModificationError::Commit { .. } => e,
                    other => ModificationError::Commit {
                        path: rel_str,
                        reason: other.to_string(),
                    },
                });
            }
        };

        let outcome = if requires_restart(&rel) {
            ModificationOutcome::RestartPending
        } else {
            ModificationOutcome::Applied
        };
        let record = ModificationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            path: rel_str.clone(),
            old_digest,
            new_digest,
            commit,
            previous_commit,
            outcome,
            created_at: Utc::now(),
        };
        // A commit without a record would be invisible to rollback, so undo it.
        if let Err(e) = self.log.append(record.clone()).await {
            warn!(path = %rel_str, error = %e, "Recording failed, reverting the commit");
            if let Err(revert_err) = self.vcs.revert_to(&record.previous_commit).await {
                warn!(path = %rel_str, error = %revert_err, "Failed to revert unrecorded commit");
            }
            restore(&absolute, previous.as_deref(), &rel_str).await;
            return Err(ModificationError::Commit {
                path: rel_str,
                reason: format!("could not record the modification: {e}"),
            });
        }

        if outcome == ModificationOutcome::RestartPending {
            *state = transition(*state, ModEvent::ChangeCommitted)?;
        }
        info!(path = %rel_str, commit = %record.short_commit(), %outcome, "Self-modification recorded");
        self.journal(
            JournalKind::Modification,
            serde_json::json!({
                "summary": format!("{rel_str} committed as {} ({outcome})", record.short_commit()),
                "record": record,
            }),
        )
        .await;

        Ok(WriteOutcome::Recorded(record))
    }

    /// Indented tree of the project, hidden and build directories skipped.
    pub async fn list_structure(&self) -> Result<String, ModificationError> {
        let root = self.root.clone();
        let lines = tokio::task::spawn_blocking(move || {
            let mut lines = Vec::new();
            walk(&root, 0, &mut lines);
            lines
        })
        .await
        .map_err(|e| ModificationError::Io {
            path: ".".into(),
            reason: e.to_string(),
        })?;

        if lines.is_empty() {
            return Ok("(empty)".into());
        }
        let total = lines.len();
        let mut shown: Vec<String> = lines.into_iter().take(STRUCTURE_LINE_CAP).collect();
        if total > STRUCTURE_LINE_CAP {
            shown.push(format!("... ({} more entries)", total - STRUCTURE_LINE_CAP));
        }
        Ok(shown.join("\n"))
    }

    /// Ask for the process to be replaced once in-flight cycles settle.
    pub async fn request_restart(&self, reason: &str) -> Result<RestartRequest, ModificationError> {
        let mut state = self.state.lock().await;
        let next = transition(*state, ModEvent::RestartRequested)?;

        let pending = self.log.pending().await;
        let last_good_commit = match pending.first() {
            Some(first) => first.previous_commit.clone(),
            None => self.vcs.head().await?,
        };
        let request = RestartRequest {
            reason: reason.to_string(),
            record_ids: pending.iter().map(|r| r.id.clone()).collect(),
            last_good_commit,
            requested_at: Utc::now(),
        };

        *state = next;
        info!(reason, pending = request.record_ids.len(), "Restart requested");
        self.journal(
            JournalKind::RestartRequested,
            serde_json::json!({
                "summary": format!("restart requested: {reason}"),
                "record_ids": request.record_ids,
            }),
        )
        .await;
        self.restart_tx.send_replace(Some(request.clone()));
        Ok(request)
    }

    /// The successor could not be launched; keep running this process.
    pub async fn abort_restart(&self, reason: &str) -> Result<ModState, ModificationError> {
        let mut state = self.state.lock().await;
        let changes_pending = !self.log.pending().await.is_empty();
        *state = transition(*state, ModEvent::RestartAborted { changes_pending })?;
        warn!(reason, "Restart aborted");
        self.restart_tx.send_replace(None);
        self.journal(
            JournalKind::Restart,
            serde_json::json!({"summary": format!("restart aborted: {reason}")}),
        )
        .await;
        Ok(*state)
    }

    /// A healthy successor has taken over.
    pub async fn mark_replaced(&self) -> Result<(), ModificationError> {
        let mut state = self.state.lock().await;
        *state = transition(*state, ModEvent::SuccessorHealthy)?;
        Ok(())
    }

    async fn journal(&self, kind: JournalKind, payload: serde_json::Value) {
        if let Some(journal) = &self.journal
            && let Err(e) = journal.append(JournalEntry::new(None, kind, payload)).await
        {
            warn!(error = %e, "Failed to journal self-modification event");
        }
    }
}

fn walk(dir: &Path, depth: usize, lines: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
            continue;
        }
        let indent = "  ".repeat(depth);
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            lines.push(format!("{indent}{name}/"));
            walk(&entry.path(), depth + 1, lines);
        } else {
            lines.push(format!("{indent}{name}"));
        }
    }
}

/// Put back what was on disk before a failed write.
async fn restore(absolute: &Path, previous: Option<&[u8]>, rel: &str) {
    let restored = match previous {
        Some(bytes) => tokio::fs::write(absolute, bytes).await,
        None => match tokio::fs::remove_file(absolute).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
    };
    if let Err(e) = restored {
        warn!(path = %rel, error = %e, "Failed to restore previous content");
    }
}
