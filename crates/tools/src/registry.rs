//! Tool registry: a versioned, atomically swapped name → tool mapping.
//!
//! Readers take an `Arc` of the current [`ToolSnapshot`] and release the lock
//! before invoking anything, so an in-flight call keeps running against the
//! mapping it started with while [`ToolRegistry::reload`] publishes a new one.
//! A snapshot is built completely before it is published; no reader can see
//! a name without its handle.

use crate::schema;
use ouroboros_core::action::{Action, ActionResult, FailureKind};
use ouroboros_core::error::ToolError;
use ouroboros_core::provider::ToolDefinition;
use ouroboros_core::tool::{DangerLevel, Tool, ToolDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Origin label for tools registered directly rather than through a source.
const PINNED: &str = "pinned";

/// Produces tools for the registry. Called at startup and on every reload.
pub trait ToolSource: Send + Sync {
    fn name(&self) -> &str;

    /// Load the tools this source currently provides.
    ///
    /// An `Err` means the source could not be read at all; the registry then
    /// keeps that source's tools from the previous snapshot.
    fn load(&self) -> Result<Vec<Arc<dyn Tool>>, ToolError>;
}

/// One immutable version of the registry mapping.
#[derive(Debug, Default)]
pub struct ToolSnapshot {
    version: u64,
    tools: HashMap<String, ToolDescriptor>,
    origins: HashMap<String, String>,
}

impl ToolSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Descriptors sorted by name.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut all: Vec<&ToolDescriptor> = self.tools.values().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn origin(&self, name: &str) -> Option<&str> {
        self.origins.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReloadReport {
    pub version: u64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub total: usize,
    /// `(source, error)` for sources that failed and kept their old tools
    pub failed_sources: Vec<(String, String)>,
}

impl std::fmt::Display for ReloadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "registry v{}: {} tools", self.version, self.total)?;
        if !self.added.is_empty() {
            write!(f, ", added {}", self.added.join(", "))?;
        }
        if !self.removed.is_empty() {
            write!(f, ", removed {}", self.removed.join(", "))?;
        }
        for (source, error) in &self.failed_sources {
            write!(f, ", source '{source}' failed: {error}")?;
        }
        Ok(())
    }
}

/// The tool registry shared by all conversations.
pub struct ToolRegistry {
    current: RwLock<Arc<ToolSnapshot>>,
    sources: Vec<Arc<dyn ToolSource>>,
    pinned: Mutex<Vec<ToolDescriptor>>,
    // Serializes writers; readers never take it.
    publish: Mutex<()>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_sources(Vec::new())
    }

    /// A registry that discovers tools from `sources` on each reload.
    pub fn with_sources(sources: Vec<Arc<dyn ToolSource>>) -> Self {
        Self {
            current: RwLock::new(Arc::new(ToolSnapshot::default())),
            sources,
            pinned: Mutex::new(Vec::new()),
            publish: Mutex::new(()),
        }
    }

    /// Register a tool directly. It survives reloads and takes precedence
    /// over a source-provided tool with the same name.
    pub fn register(&self, descriptor: ToolDescriptor) {
        let _writer = self.publish.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut pinned = self.pinned.lock().unwrap_or_else(|e| e.into_inner());
            pinned.retain(|d| d.name() != descriptor.name());
            pinned.push(descriptor.clone());
        }

        let old = self.snapshot();
        let mut tools = old.tools.clone();
        let mut origins = old.origins.clone();
        debug!(tool = %descriptor.name(), "Registering tool");
        origins.insert(descriptor.name().to_string(), PINNED.to_string());
        tools.insert(descriptor.name().to_string(), descriptor);
        self.publish_snapshot(ToolSnapshot {
            version: old.version + 1,
            tools,
            origins,
        });
    }

    /// Convenience for `register(ToolDescriptor::new(tool))`.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        self.register(ToolDescriptor::new(tool));
    }

    /// Rebuild the mapping from pinned tools and all sources, then swap it in.
    pub fn reload(&self) -> ReloadReport {
        let _writer = self.publish.lock().unwrap_or_else(|e| e.into_inner());
        let old = self.snapshot();

        let mut tools: HashMap<String, ToolDescriptor> = HashMap::new();
        let mut origins: HashMap<String, String> = HashMap::new();
        let mut failed_sources = Vec::new();

        for source in &self.sources {
            match source.load() {
                Ok(loaded) => {
                    for handle in loaded {
                        let descriptor = ToolDescriptor::new(handle);
                        let name = descriptor.name().to_string();
                        if let Some(existing) = origins.get(&name) {
                            warn!(tool = %name, source = source.name(), kept = %existing, "Duplicate tool name, keeping first");
                            continue;
                        }
                        origins.insert(name.clone(), source.name().to_string());
                        tools.insert(name, descriptor);
                    }
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "Tool source failed, keeping previous tools");
                    for (name, origin) in &old.origins {
                        if origin == source.name()
                            && !tools.contains_key(name)
                            && let Some(descriptor) = old.tools.get(name)
                        {
                            origins.insert(name.clone(), origin.clone());
                            tools.insert(name.clone(), descriptor.clone());
                        }
                    }
                    failed_sources.push((source.name().to_string(), e.to_string()));
                }
            }
        }

        let pinned = self.pinned.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for descriptor in pinned {
            origins.insert(descriptor.name().to_string(), PINNED.to_string());
            tools.insert(descriptor.name().to_string(), descriptor);
        }

        let mut added: Vec<String> = tools
            .keys()
            .filter(|n| !old.tools.contains_key(*n))
            .cloned()
            .collect();
        let mut removed: Vec<String> = old
            .tools
            .keys()
            .filter(|n| !tools.contains_key(*n))
            .cloned()
            .collect();
        added.sort();
        removed.sort();

        let snapshot = ToolSnapshot {
            version: old.version + 1,
            tools,
            origins,
        };
        let report = ReloadReport {
            version: snapshot.version,
            added,
            removed,
            total: snapshot.len(),
            failed_sources,
        };
        self.publish_snapshot(snapshot);
        info!(%report, "Tool registry reloaded");
        report
    }

    fn publish_snapshot(&self, snapshot: ToolSnapshot) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Arc::new(snapshot);
    }

    /// The current mapping. Holding it pins that version.
    pub fn snapshot(&self) -> Arc<ToolSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        self.snapshot().get(name).cloned()
    }

    /// All descriptors, sorted by name.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.snapshot().descriptors().into_iter().cloned().collect()
    }

    /// Definitions for the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.snapshot()
            .descriptors()
            .into_iter()
            .map(|d| d.definition.clone())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().names().into_iter().map(String::from).collect()
    }

    pub fn danger_of(&self, name: &str) -> Option<DangerLevel> {
        self.snapshot().get(name).map(ToolDescriptor::danger_level)
    }

    /// Validate and execute one action. Never returns an error: every
    /// failure becomes a failed [`ActionResult`].
    pub async fn invoke(&self, action: &Action) -> ActionResult {
        let snapshot = self.snapshot();
        invoke_in(&snapshot, action).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoke against a pinned snapshot.
pub async fn invoke_in(snapshot: &ToolSnapshot, action: &Action) -> ActionResult {
    let started = Instant::now();

    let Some(descriptor) = snapshot.get(&action.tool) else {
        let available = snapshot.names().join(", ");
        return ActionResult::failure(
            action,
            FailureKind::NotFound,
            format!("Unknown tool '{}'. Available tools: {available}", action.tool),
            started.elapsed(),
        );
    };

    if let Err(reason) = schema::validate(&descriptor.definition.parameters, &action.arguments) {
        debug!(tool = %action.tool, %reason, "Argument validation failed");
        let error = ToolError::Validation {
            tool_name: action.tool.clone(),
            reason,
        };
        return ActionResult::from_tool_error(action, &error, started.elapsed());
    }

    match descriptor.handle.execute(action.arguments.clone()).await {
        Ok(output) if output.success => {
            ActionResult::success(action, output.output, started.elapsed())
                .with_data(output.data)
                .with_side_effects(output.side_effects)
        }
        Ok(output) => ActionResult::failure(
            action,
            FailureKind::Execution,
            output.output,
            started.elapsed(),
        )
        .with_side_effects(output.side_effects),
        Err(error) => ActionResult::from_tool_error(action, &error, started.elapsed()),
    }
}
