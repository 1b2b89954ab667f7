//! File-backed action journal: one JSON entry per line.
//!
//! Every append is written and synced before it returns, so a gate decision
//! is on disk before the action it governs runs. The most recent entries
//! are also kept in memory for the context assembler.

use async_trait::async_trait;
use ouroboros_core::error::JournalError;
use ouroboros_core::journal::{Journal, JournalEntry};
use ouroboros_core::message::ConversationId;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 500;

pub struct FileJournal {
    path: Option<PathBuf>,
    recent: RwLock<VecDeque<JournalEntry>>,
    capacity: usize,
    /// Serializes writers so lines never interleave
    write_lock: Mutex<()>,
}

impl FileJournal {
    /// Open (or create on first append) the journal at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let recent = Self::load_tail(&path, DEFAULT_CAPACITY);
        debug!(path = %path.display(), loaded = recent.len(), "Journal opened");
        Self {
            path: Some(path),
            recent: RwLock::new(recent),
            capacity: DEFAULT_CAPACITY,
            write_lock: Mutex::new(()),
        }
    }

    /// A journal that only keeps entries in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            recent: RwLock::new(VecDeque::new()),
            capacity: DEFAULT_CAPACITY,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn load_tail(path: &Path, capacity: usize) -> VecDeque<JournalEntry> {
        let Ok(content) = std::fs::read_to_string(path) else {
            return VecDeque::new();
        };
        let mut entries = VecDeque::with_capacity(capacity);
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => {
                    if entries.len() == capacity {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
                Err(e) => warn!(error = %e, "Skipping corrupted journal line"),
            }
        }
        entries
    }

    async fn write_line(&self, path: &Path, line: &str) -> Result<(), JournalError> {
        let storage = |e: std::io::Error| JournalError::Storage(format!("{}: {e}", path.display()));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(storage)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(storage)?;
        file.write_all(line.as_bytes()).await.map_err(storage)?;
        file.sync_data().await.map_err(storage)
    }
}

#[async_trait]
impl Journal for FileJournal {
    async fn append(&self, entry: JournalEntry) -> Result<(), JournalError> {
        let mut line =
            serde_json::to_string(&entry).map_err(|e| JournalError::Encoding(e.to_string()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(path) = &self.path {
            self.write_line(path, &line).await?;
        }

        let mut recent = self.recent.write().await;
        if recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(entry);
        Ok(())
    }

    async fn recent(
        &self,
        conversation_id: Option<&ConversationId>,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, JournalError> {
        let recent = self.recent.read().await;
        let mut matching: Vec<JournalEntry> = recent
            .iter()
            .rev()
            .filter(|e| conversation_id.is_none() || e.conversation_id.as_ref() == conversation_id)
            .take(limit)
            .cloned()
            .collect();
        matching.reverse();
        Ok(matching)
    }

    async fn flush(&self) -> Result<(), JournalError> {
        // Appends are synced as they happen; waiting for the lock drains
        // any writer that is mid-line.
        let _guard = self.write_lock.lock().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ouroboros_core::journal::JournalKind;
    use serde_json::json;

    fn entry(conv: &str, kind: JournalKind, n: u32) -> JournalEntry {
        JournalEntry::new(Some(&ConversationId::from(conv)), kind, json!({"n": n}))
    }

    #[tokio::test]
    async fn recent_filters_by_conversation() {
        let journal = FileJournal::in_memory();
        journal.append(entry("a", JournalKind::Inbound, 1)).await.unwrap();
        journal.append(entry("b", JournalKind::Inbound, 2)).await.unwrap();
        journal.append(entry("a", JournalKind::Reply, 3)).await.unwrap();

        let a = ConversationId::from("a");
        let entries = journal.recent(Some(&a), 10).await.unwrap();
        let ns: Vec<_> = entries.iter().map(|e| e.payload["n"].as_u64().unwrap()).collect();
        assert_eq!(ns, vec![1, 3]);
        assert_eq!(journal.recent(None, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/journal.jsonl");
        {
            let journal = FileJournal::open(&path);
            journal.append(entry("a", JournalKind::Gate, 1)).await.unwrap();
            journal.append(entry("a", JournalKind::ToolOk, 2)).await.unwrap();
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json\n");
        std::fs::write(&path, content).unwrap();

        let journal = FileJournal::open(&path);
        let entries = journal.recent(None, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, JournalKind::Gate);
    }

    #[tokio::test]
    async fn ring_buffer_is_bounded() {
        let journal = FileJournal::in_memory().with_capacity(3);
        for n in 0..5 {
            journal.append(entry("a", JournalKind::Inbound, n)).await.unwrap();
        }
        let entries = journal.recent(None, 10).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].payload["n"], 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in place of the file cannot be opened for append.
        let path = dir.path().join("journal.jsonl");
        std::fs::create_dir(&path).unwrap();
        let journal = FileJournal::open(&path);
        let err = journal.append(entry("a", JournalKind::Gate, 1)).await.unwrap_err();
        assert!(matches!(err, JournalError::Storage(_)));
        assert!(journal.recent(None, 10).await.unwrap().is_empty());
    }
}
