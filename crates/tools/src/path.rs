//! Path guard: keeps file tools inside allowed roots and out of
//! sensitive locations (e.g., ~/.ssh, /etc).
//!
//! Paths are resolved lexically first, then the deepest existing ancestor is
//! canonicalized so symlinks cannot be used to escape a root.

use std::path::{Component, Path, PathBuf};

/// Error returned when a path is refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PathError {
    #[error("Path '{path}' is outside allowed roots")]
    OutsideAllowedRoots { path: String },

    #[error("Path '{path}' matches forbidden location '{rule}'")]
    Forbidden { path: String, rule: String },

    #[error("Path '{path}' could not be resolved: {reason}")]
    Unresolvable { path: String, reason: String },
}

/// Allowed roots and forbidden prefixes for filesystem access.
#[derive(Debug, Clone, Default)]
pub struct PathGuard {
    allowed_roots: Vec<PathBuf>,
    forbidden: Vec<(String, PathBuf)>,
}

impl PathGuard {
    /// Empty `allowed_roots` means anywhere not forbidden.
    pub fn new(allowed_roots: &[String], forbidden_paths: &[String]) -> Self {
        Self {
            allowed_roots: allowed_roots.iter().map(|r| resolve_rule(r)).collect(),
            forbidden: forbidden_paths
                .iter()
                .map(|f| (f.clone(), resolve_rule(f)))
                .collect(),
        }
    }

    /// Resolve `path` and check it against the rules.
    ///
    /// Returns the absolute, symlink-resolved path on success. The file
    /// itself need not exist yet.
    pub fn check(&self, path: &str) -> Result<PathBuf, PathError> {
        if path.trim().is_empty() {
            return Err(PathError::Unresolvable {
                path: path.into(),
                reason: "empty path".into(),
            });
        }

        let absolute = absolutize(Path::new(&expand_tilde(path))).map_err(|reason| {
            PathError::Unresolvable {
                path: path.into(),
                reason,
            }
        })?;
        let resolved = canonicalize_existing_prefix(&absolute);

        for (rule, forbidden) in &self.forbidden {
            if resolved.starts_with(forbidden) || absolute.starts_with(forbidden) {
                return Err(PathError::Forbidden {
                    path: path.into(),
                    rule: rule.clone(),
                });
            }
        }

        if !self.allowed_roots.is_empty()
            && !self.allowed_roots.iter().any(|root| resolved.starts_with(root))
        {
            return Err(PathError::OutsideAllowedRoots { path: path.into() });
        }

        Ok(resolved)
    }
}

fn resolve_rule(rule: &str) -> PathBuf {
    let absolute = absolutize(Path::new(&expand_tilde(rule))).unwrap_or_else(|_| PathBuf::from(rule));
    canonicalize_existing_prefix(&absolute)
}

/// Join onto the working directory and fold `.` / `..` without touching disk.
fn absolutize(path: &Path) -> Result<PathBuf, String> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| format!("no working directory: {e}"))?
            .join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// Canonicalize the longest existing ancestor and re-append the rest.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Expand ~ to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if (path.starts_with("~/") || path == "~")
        && let Some(home) = home_dir()
    {
        return path.replacen('~', &home, 1);
    }
    path.to_string()
}

fn home_dir() -> Option<String> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok()
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok()
    }
}
