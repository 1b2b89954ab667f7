//! Version control adapter. Every self-modification becomes a commit, and a
//! rollback is a revert commit, so history is never rewritten.

use async_trait::async_trait;
use ouroboros_core::error::ModificationError;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Current commit reference.
    async fn head(&self) -> Result<String, ModificationError>;

    /// Commit the given paths (relative to the repository root) and return
    /// the new commit reference.
    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<String, ModificationError>;

    /// Make the working tree match `good` with new commits on top of HEAD.
    /// Returns the resulting HEAD. A no-op when the tree already matches.
    async fn revert_to(&self, good: &str) -> Result<String, ModificationError>;
}

/// A git repository driven through the `git` binary.
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run git and return trimmed stdout, or the stderr text on failure.
    async fn git(&self, args: &[&str]) -> Result<String, String> {
        debug!(args = ?args, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .await
            .map_err(|e| format!("failed to run git: {e}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Err(if stderr.is_empty() { stdout } else { stderr })
        }
    }

    /// Whether git exits 0 (used for `diff --quiet` style checks).
    async fn git_succeeds(&self, args: &[&str]) -> Result<bool, ModificationError> {
        let status = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .status()
            .await
            .map_err(|e| ModificationError::VersionControl(format!("failed to run git: {e}")))?;
        Ok(status.success())
    }
}

#[async_trait]
impl VersionControl for GitRepo {
    async fn head(&self) -> Result<String, ModificationError> {
        self.git(&["rev-parse", "HEAD"])
            .await
            .map_err(ModificationError::VersionControl)
    }

    async fn commit(&self, paths: &[PathBuf], message: &str) -> Result<String, ModificationError> {
        let path_args: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        let commit_error = |reason: String| ModificationError::Commit {
            path: path_args.join(", "),
            reason,
        };

        let mut add = vec!["add", "--"];
        add.extend(path_args.iter().map(String::as_str));
        self.git(&add).await.map_err(commit_error)?;

        let mut commit = vec!["commit", "--no-verify", "-m", message, "--"];
        commit.extend(path_args.iter().map(String::as_str));
        self.git(&commit).await.map_err(commit_error)?;

        let head = self.head().await?;
        info!(commit = %head, %message, "Committed self-modification");
        Ok(head)
    }

    async fn revert_to(&self, good: &str) -> Result<String, ModificationError> {
        if self.git_succeeds(&["diff", "--quiet", good, "HEAD"]).await? {
            return self.head().await;
        }

        let range = format!("{good}..HEAD");
        if let Err(reason) = self.git(&["revert", "--no-commit", &range]).await {
            if let Err(abort) = self.git(&["revert", "--abort"]).await {
                warn!(error = %abort, "git revert --abort failed");
            }
            return Err(ModificationError::VersionControl(format!(
                "revert of {range} failed: {reason}"
            )));
        }
        let message = format!("rollback: restore {good}");
        self.git(&["commit", "--no-verify", "-m", &message])
            .await
            .map_err(ModificationError::VersionControl)?;

        let head = self.head().await?;
        info!(good = %good, head = %head, "Rolled back self-modifications");
        Ok(head)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Initialise a repository with one commit, or `None` if git is unavailable.
    pub(crate) async fn init_repo(dir: &Path) -> Option<GitRepo> {
        let repo = GitRepo::new(dir);
        repo.git(&["init", "-q"]).await.ok()?;
        repo.git(&["config", "user.email", "agent@example.com"]).await.ok()?;
        repo.git(&["config", "user.name", "agent"]).await.ok()?;
        std::fs::write(dir.join("README.md"), "v0\n").ok()?;
        repo.git(&["add", "README.md"]).await.ok()?;
        repo.git(&["commit", "-q", "-m", "init"]).await.ok()?;
        Some(repo)
    }

    #[tokio::test]
    async fn commit_and_revert() {
        let dir = tempfile::tempdir().unwrap();
        let Some(repo) = init_repo(dir.path()).await else {
            return;
        };
        let base = repo.head().await.unwrap();

        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        let c1 = repo
            .commit(&[PathBuf::from("src/main.rs")], "self-modify: update src/main.rs")
            .await
            .unwrap();
        assert_ne!(c1, base);

        std::fs::write(dir.path().join("README.md"), "v1\n").unwrap();
        repo.commit(&[PathBuf::from("README.md")], "second").await.unwrap();

        let head = repo.revert_to(&base).await.unwrap();
        assert!(!dir.path().join("src/main.rs").exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("README.md")).unwrap(), "v0\n");

        // Already at the good tree: nothing new.
        assert_eq!(repo.revert_to(&base).await.unwrap(), head);
    }

    #[tokio::test]
    async fn commit_without_changes_fails() {
        let dir = tempfile::tempdir().unwrap();
        let Some(repo) = init_repo(dir.path()).await else {
            return;
        };
        let err = repo
            .commit(&[PathBuf::from("README.md")], "noop")
            .await
            .unwrap_err();
        assert!(matches!(err, ModificationError::Commit { .. }));
    }
}
