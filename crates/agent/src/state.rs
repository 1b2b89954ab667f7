//! Durable per-conversation state under the state directory.
//!
//! ```text
//! <state>/conversations/<id>.jsonl   turns, one per line
//! <state>/pending/<id>.json          suspended cycle awaiting confirmation
//! <state>/meta/<id>.json             autonomy override and standing approvals
//! ```
//!
//! Whole-file records are written to a temp file and renamed into place, so
//! a crash leaves either the old or the new version.

use chrono::{DateTime, Utc};
use ouroboros_core::action::Action;
use ouroboros_core::autonomy::AutonomyLevel;
use ouroboros_core::error::StateError;
use ouroboros_core::message::{Conversation, ConversationId, Turn};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// A cycle suspended at a gated action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCycle {
    pub conversation_id: ConversationId,
    /// The gated action first, then the actions queued behind it. Danger
    /// levels are already resolved.
    pub actions: Vec<Action>,
    /// Cycle index the suspension happened in
    pub iteration: u32,
    /// Autonomy level the gate evaluated under
    pub autonomy: AutonomyLevel,
    pub suspended_at: DateTime<Utc>,
}

impl PendingCycle {
    pub fn gated(&self) -> Option<&Action> {
        self.actions.first()
    }
}

/// Per-conversation settings that outlive a process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomy_override: Option<AutonomyLevel>,

    /// Tools the user approved with "always"
    #[serde(default)]
    pub standing_approvals: BTreeSet<String>,
}

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn conversation_path(&self, id: &ConversationId) -> PathBuf {
        self.dir
            .join("conversations")
            .join(format!("{}.jsonl", id.file_stem()))
    }

    fn pending_path(&self, id: &ConversationId) -> PathBuf {
        self.dir.join("pending").join(format!("{}.json", id.file_stem()))
    }

    fn meta_path(&self, id: &ConversationId) -> PathBuf {
        self.dir.join("meta").join(format!("{}.json", id.file_stem()))
    }

    /// Load a conversation's turns; an unknown id yields an empty conversation.
    pub async fn load_conversation(&self, id: &ConversationId) -> Result<Conversation, StateError> {
        let path = self.conversation_path(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Conversation::new(id.clone()));
            }
            Err(e) => return Err(storage(&path, e)),
        };

        let turns: Vec<Turn> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Turn>(line) {
                Ok(turn) => Some(turn),
                Err(e) => {
                    warn!(conversation = %id, error = %e, "Skipping corrupted turn");
                    None
                }
            })
            .collect();
        debug!(conversation = %id, turns = turns.len(), "Conversation loaded");
        Ok(Conversation::restore(id.clone(), turns))
    }

    pub async fn append_turn(&self, id: &ConversationId, turn: &Turn) -> Result<(), StateError> {
        let path = self.conversation_path(id);
        let mut line = serde_json::to_string(turn).map_err(|e| corrupt(&path, e))?;
        line.push('\n');
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage(&path, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| storage(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| storage(&path, e))?;
        // tokio hands writes to a blocking thread; without this the file can
        // be dropped before the line reaches the OS.
        file.flush().await.map_err(|e| storage(&path, e))?;
        file.sync_data().await.map_err(|e| storage(&path, e))
    }

    pub async fn save_pending(&self, pending: &PendingCycle) -> Result<(), StateError> {
        write_atomic(&self.pending_path(&pending.conversation_id), pending).await
    }

    pub async fn load_pending(&self, id: &ConversationId) -> Result<Option<PendingCycle>, StateError> {
        read_json(&self.pending_path(id)).await
    }

    pub async fn clear_pending(&self, id: &ConversationId) -> Result<(), StateError> {
        let path = self.pending_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage(&path, e)),
        }
    }

    /// Every suspended cycle on disk, sorted by suspension time.
    pub async fn list_pending(&self) -> Result<Vec<PendingCycle>, StateError> {
        let dir = self.dir.join("pending");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage(&dir, e)),
        };

        let mut pending = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| storage(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<PendingCycle>(&path).await {
                Ok(Some(cycle)) => pending.push(cycle),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable pending cycle"),
            }
        }
        pending.sort_by_key(|p| p.suspended_at);
        Ok(pending)
    }

    pub async fn load_meta(&self, id: &ConversationId) -> Result<ConversationMeta, StateError> {
        Ok(read_json(&self.meta_path(id)).await?.unwrap_or_default())
    }

    pub async fn save_meta(&self, id: &ConversationId, meta: &ConversationMeta) -> Result<(), StateError> {
        write_atomic(&self.meta_path(id), meta).await
    }
}

fn storage(path: &Path, e: std::io::Error) -> StateError {
    StateError::Storage {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn corrupt(path: &Path, e: serde_json::Error) -> StateError {
    StateError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text).map(Some).map_err(|e| corrupt(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(storage(path, e)),
    }
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| corrupt(path, e))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| storage(path, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| storage(&tmp, e))?;
    file.write_all(&json).await.map_err(|e| storage(&tmp, e))?;
    file.sync_all().await.map_err(|e| storage(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| storage(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ouroboros_core::tool::DangerLevel;
    use serde_json::json;

    fn pending(id: &str) -> PendingCycle {
        let mut action = Action::new("call_1", "shell", json!({"command": "make"}));
        action.danger = Some(DangerLevel::Dangerous);
        PendingCycle {
            conversation_id: ConversationId::from(id),
            actions: vec![action, Action::new("call_2", "file_read", json!({"path": "x"}))],
            iteration: 2,
            autonomy: AutonomyLevel::Careful,
            suspended_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn turns_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let id = ConversationId::from("telegram:42");

        assert!(store.load_conversation(&id).await.unwrap().is_empty());
        store.append_turn(&id, &Turn::user("hi")).await.unwrap();
        store.append_turn(&id, &Turn::agent("hello")).await.unwrap();

        let conv = store.load_conversation(&id).await.unwrap();
        let contents: Vec<_> = conv.turns().iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "hello"]);
    }

    #[tokio::test]
    async fn appended_turn_is_on_disk_when_append_returns() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let id = ConversationId::from("dave");

        for n in 1..=20 {
            store.append_turn(&id, &Turn::user(format!("line {n}"))).await.unwrap();
            let raw = std::fs::read_to_string(store.conversation_path(&id)).unwrap();
            assert_eq!(raw.lines().count(), n);
            assert!(raw.ends_with('\n'));
        }
    }

    #[tokio::test]
    async fn pending_survives_a_new_store() {
        let dir = tempfile::tempdir().unwrap();
        let original = pending("alice");
        StateStore::new(dir.path()).save_pending(&original).await.unwrap();

        let store = StateStore::new(dir.path());
        let loaded = store.load_pending(&original.conversation_id).await.unwrap();
        assert_eq!(loaded.as_ref(), Some(&original));
        assert_eq!(loaded.unwrap().gated().unwrap().danger, Some(DangerLevel::Dangerous));

        assert_eq!(store.list_pending().await.unwrap().len(), 1);
        store.clear_pending(&original.conversation_id).await.unwrap();
        store.clear_pending(&original.conversation_id).await.unwrap();
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_pending_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let id = ConversationId::from("bob");
        std::fs::create_dir_all(dir.path().join("pending")).unwrap();
        std::fs::write(dir.path().join("pending/bob.json"), "{").unwrap();
        assert!(matches!(
            store.load_pending(&id).await,
            Err(StateError::Corrupt { .. })
        ));
        // Listing skips it instead of failing every conversation.
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn meta_defaults_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let id = ConversationId::from("carol");
        assert_eq!(store.load_meta(&id).await.unwrap(), ConversationMeta::default());

        let mut meta = ConversationMeta::default();
        meta.autonomy_override = Some(AutonomyLevel::Paranoid);
        meta.standing_approvals.insert("shell".into());
        store.save_meta(&id, &meta).await.unwrap();
        assert_eq!(store.load_meta(&id).await.unwrap(), meta);
    }
}
