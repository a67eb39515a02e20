//! Name-to-capability registry, scoped to one dispatcher.
//!
//! Each dispatcher owns exactly one registry; registries are never shared
//! across users. Tools are stored as [`SharedTool`] so an invocation clones
//! the `Arc` out and releases the registry before the call awaits.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::error::{Error, Result};
use crate::tool::{SharedTool, ToolDefinition};

/// A collection of tools available to one dispatcher.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, SharedTool>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with the given tools.
    ///
    /// # Errors
    /// Returns [`Error::Invalid`] if two tools share a name.
    pub fn from_tools(tools: impl IntoIterator<Item = SharedTool>) -> Result<Self> {
        let mut registry = Self::new();
        for tool in tools {
            registry.register(tool)?;
        }
        Ok(registry)
    }

    /// Register a tool under its own name.
    ///
    /// # Errors
    /// Returns [`Error::Invalid`] if a tool with the same name is already
    /// registered.
    pub fn register(&mut self, tool: SharedTool) -> Result<()> {
        let name = tool.name().to_owned();
        if self.tools.contains_key(&name) {
            return Err(Error::invalid(format!("Tool '{name}' already registered")));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Check if the registry contains a tool with the given name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<SharedTool> {
        self.tools.get(name).cloned()
    }

    /// The set of registered tool names.
    #[must_use]
    pub fn names(&self) -> BTreeSet<String> {
        self.tools.keys().cloned().collect()
    }

    /// Definitions of all registered tools.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Remove every tool. Used on dispatcher cleanup; subsequent reads see
    /// an empty registry.
    pub fn clear(&mut self) {
        self.tools.clear();
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
