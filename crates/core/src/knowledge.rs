//! Knowledge sources: markdown files that shape the system prompt.
//!
//! Loading follows a fixed order (later sections append):
//!
//! 1. **Agent**: `AGENT.md` (who the agent is)
//! 2. **Rules**: `RULES.md` (hard constraints)
//! 3. **Memory**: `MEMORY.md` (facts the agent wrote about itself)
//! 4. **Skills**: every other `.md` file in `skills/`, sorted by name
//! 5. **Extra files**: paths listed in configuration
//!
//! Missing files are skipped. A configured directory that exists but cannot
//! be read is an error: the turn must not run on silently partial knowledge.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::AssemblyError;

pub const AGENT_FILE: &str = "AGENT.md";
pub const RULES_FILE: &str = "RULES.md";
pub const MEMORY_FILE: &str = "MEMORY.md";
pub const SKILLS_DIR: &str = "skills";

/// One titled block of knowledge.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeSection {
    /// Source path or label
    pub source: String,
    /// Short heading, rendered as an XML-style tag
    pub heading: String,
    pub content: String,
}

/// Anything that can contribute knowledge sections to the system prompt.
pub trait KnowledgeSource: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self) -> Result<Vec<KnowledgeSection>, AssemblyError>;
}

/// Render sections into one prompt block.
pub fn render_sections(sections: &[KnowledgeSection]) -> String {
    let mut prompt = String::with_capacity(4096);
    for section in sections {
        let tag = section
            .heading
            .to_lowercase()
            .replace([' ', '-'], "_")
            .replace([':', '(', ')'], "");
        prompt.push_str(&format!("<{tag}>\n{}\n</{tag}>\n", section.content.trim()));
    }
    prompt
}

/// Fixed text, for tests and prompt overrides.
pub struct StaticKnowledge {
    text: String,
}

impl StaticKnowledge {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl KnowledgeSource for StaticKnowledge {
    fn name(&self) -> &str {
        "static"
    }

    fn load(&self) -> Result<Vec<KnowledgeSection>, AssemblyError> {
        if self.text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![KnowledgeSection {
            source: "<static>".into(),
            heading: "Identity".into(),
            content: self.text.clone(),
        }])
    }
}

/// Markdown files in a knowledge directory.
pub struct MarkdownKnowledge {
    dir: PathBuf,
    extra_files: Vec<PathBuf>,
}

impl MarkdownKnowledge {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extra_files: Vec::new(),
        }
    }

    pub fn with_extra_files(mut self, files: Vec<PathBuf>) -> Self {
        self.extra_files = files;
        self
    }

    fn read(&self, path: &Path) -> Result<Option<String>, AssemblyError> {
        match std::fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AssemblyError::Knowledge {
                source_name: path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn push_file(
        &self,
        path: &Path,
        heading: &str,
        sections: &mut Vec<KnowledgeSection>,
    ) -> Result<(), AssemblyError> {
        if let Some(content) = self.read(path)? {
            debug!(file = %path.display(), "Loaded knowledge file");
            sections.push(KnowledgeSection {
                source: path.display().to_string(),
                heading: heading.to_string(),
                content,
            });
        }
        Ok(())
    }

    fn skill_files(&self) -> Result<Vec<PathBuf>, AssemblyError> {
        let dir = self.dir.join(SKILLS_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&dir).map_err(|e| AssemblyError::Knowledge {
            source_name: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|ext| ext.to_str()) == Some("md"))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('_'))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

impl KnowledgeSource for MarkdownKnowledge {
    fn name(&self) -> &str {
        "markdown"
    }

    fn load(&self) -> Result<Vec<KnowledgeSection>, AssemblyError> {
        let mut sections = Vec::new();

        self.push_file(&self.dir.join(AGENT_FILE), "Identity", &mut sections)?;
        self.push_file(&self.dir.join(RULES_FILE), "Rules", &mut sections)?;
        self.push_file(&self.dir.join(MEMORY_FILE), "Memory", &mut sections)?;

        for path in self.skill_files()? {
            let stem = path
                .file_stem()
                .and_then(|n| n.to_str())
                .unwrap_or("skill")
                .to_string();
            self.push_file(&path, &format!("Skill {stem}"), &mut sections)?;
        }

        for path in &self.extra_files {
            let name = path
                .file_stem()
                .and_then(|n| n.to_str())
                .unwrap_or("extra")
                .to_string();
            self.push_file(path, &format!("Context {name}"), &mut sections)?;
        }

        debug!(sections = sections.len(), dir = %self.dir.display(), "Knowledge loaded");
        Ok(sections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_yields_nothing() {
        let source = MarkdownKnowledge::new("/definitely/not/here");
        assert!(source.load().unwrap().is_empty());
    }

    #[test]
    fn loads_in_fixed_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RULES_FILE), "Never delete backups.").unwrap();
        std::fs::write(dir.path().join(AGENT_FILE), "You are Ouroboros.").unwrap();
        std::fs::create_dir(dir.path().join(SKILLS_DIR)).unwrap();
        std::fs::write(dir.path().join("skills/b_deploy.md"), "Deploy steps").unwrap();
        std::fs::write(dir.path().join("skills/a_review.md"), "Review steps").unwrap();
        std::fs::write(dir.path().join("skills/_template.md"), "ignored").unwrap();

        let sections = MarkdownKnowledge::new(dir.path()).load().unwrap();
        let headings: Vec<_> = sections.iter().map(|s| s.heading.as_str()).collect();
        assert_eq!(headings, vec!["Identity", "Rules", "Skill a_review", "Skill b_deploy"]);
    }

    #[test]
    fn empty_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MEMORY_FILE), "   \n").unwrap();
        assert!(MarkdownKnowledge::new(dir.path()).load().unwrap().is_empty());
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where a file is expected cannot be read as text.
        std::fs::create_dir(dir.path().join(AGENT_FILE)).unwrap();
        let err = MarkdownKnowledge::new(dir.path()).load().unwrap_err();
        assert!(matches!(err, AssemblyError::Knowledge { .. }));
    }

    #[test]
    fn render_uses_tags() {
        let text = render_sections(&[KnowledgeSection {
            source: "x".into(),
            heading: "Skill a-review".into(),
            content: "Look closely.\n".into(),
        }]);
        assert_eq!(text, "<skill_a_review>\nLook closely.\n</skill_a_review>\n");
    }

    #[test]
    fn static_knowledge() {
        let sections = StaticKnowledge::new("You are a test agent.").load().unwrap();
        assert_eq!(sections.len(), 1);
        assert!(StaticKnowledge::new("").load().unwrap().is_empty());
    }
}
