//! Tool registry and built-in tools for Ouroboros.
//!
//! Tools give the agent the ability to interact with the world:
//! run shell commands, read/write files and fetch web pages. Extension
//! manifests add command-line tools without recompiling, and the registry
//! picks up changes on reload.

pub mod extension;
pub mod file_read;
pub mod file_write;
pub mod path;
pub mod registry;
pub mod schema;
pub mod shell;
pub mod web_fetch;

use ouroboros_config::ToolsConfig;
use ouroboros_core::error::ToolError;
use ouroboros_core::tool::Tool;
use std::sync::Arc;
use std::time::Duration;

pub use extension::{CommandTool, ExtensionDirSource, ExtensionManifest};
pub use path::{PathError, PathGuard};
pub use registry::{ReloadReport, ToolRegistry, ToolSnapshot, ToolSource};

/// Produces the built-in tools from configuration.
pub struct BuiltinSource {
    config: ToolsConfig,
}

impl BuiltinSource {
    pub fn new(config: ToolsConfig) -> Self {
        Self { config }
    }
}

impl ToolSource for BuiltinSource {
    fn name(&self) -> &str {
        "builtin"
    }

    fn load(&self) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
        let guard = PathGuard::new(&self.config.allowed_roots, &self.config.forbidden_paths);
        Ok(vec![
            Arc::new(file_read::FileReadTool::with_guard(guard.clone())),
            Arc::new(file_write::FileWriteTool::with_guard(guard)),
            Arc::new(shell::ShellTool::new(
                self.config.allowed_commands.clone(),
                Duration::from_secs(self.config.shell_timeout_secs),
            )),
            Arc::new(web_fetch::WebFetchTool::new(
                Duration::from_secs(self.config.fetch_timeout_secs),
                self.config.fetch_max_bytes,
            )),
        ])
    }
}

/// Build a registry over the built-in tools and configured extension dirs,
/// loaded once.
pub fn default_registry(config: &ToolsConfig) -> ToolRegistry {
    let sources: Vec<Arc<dyn ToolSource>> = vec![
        Arc::new(BuiltinSource::new(config.clone())),
        Arc::new(ExtensionDirSource::new(config.extension_dirs.clone())),
    ];
    let registry = ToolRegistry::with_sources(sources);
    registry.reload();
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use ouroboros_core::DangerLevel;

    #[test]
    fn default_registry_has_builtins_with_danger_levels() {
        let config = ToolsConfig {
            extension_dirs: vec![],
            ..ToolsConfig::default()
        };
        let registry = default_registry(&config);
        assert_eq!(
            registry.names(),
            vec!["file_read", "file_write", "shell", "web_fetch"]
        );
        assert_eq!(registry.danger_of("file_read"), Some(DangerLevel::Safe));
        assert_eq!(registry.danger_of("file_write"), Some(DangerLevel::Moderate));
        assert_eq!(registry.danger_of("shell"), Some(DangerLevel::Dangerous));
    }

    #[test]
    fn reload_picks_up_new_extension() {
        let dir = tempfile::tempdir().unwrap();
        let config = ToolsConfig {
            extension_dirs: vec![dir.path().to_path_buf()],
            ..ToolsConfig::default()
        };
        let registry = default_registry(&config);
        assert!(registry.get("greet").is_none());

        std::fs::write(
            dir.path().join("greet.tool.toml"),
            "name = 'greet'\ndescription = 'Say hi'\ndanger = 'safe'\ncommand = ['echo', 'hi']\n",
        )
        .unwrap();
        let report = registry.reload();
        assert_eq!(report.added, vec!["greet"]);
        assert_eq!(registry.danger_of("greet"), Some(DangerLevel::Safe));

        std::fs::remove_file(dir.path().join("greet.tool.toml")).unwrap();
        let report = registry.reload();
        assert_eq!(report.removed, vec!["greet"]);
    }
}
