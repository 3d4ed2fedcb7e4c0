//! Diagnostic tool adapters
//!
//! Each [`DiagnosticTool`] value maps to exactly one adapter implementing
//! [`DiagnosticToolAdapter`]. The [`ToolRegistry`] resolves a session's tool
//! to its adapter; a tool without an adapter is a fatal configuration error
//! for that run.
//!
//! | Tool | Adapter |
//! |------|---------|
//! | Memory Dump | [`CommandToolAdapter`] (configured program) |
//! | Profiler | [`CommandToolAdapter`] (configured program) |

mod adapter;
mod command;

pub use adapter::{DiagnosticToolAdapter, ToolOutput};
pub use command::CommandToolAdapter;

use crate::config::ToolsConfig;
use crate::error::{Error, Result};
use crate::types::DiagnosticTool;
use std::collections::HashMap;
use std::sync::Arc;

/// Lookup table from tool to adapter.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    adapters: HashMap<DiagnosticTool, Arc<dyn DiagnosticToolAdapter>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command adapter for every tool with a configured program.
    pub fn from_config(config: &ToolsConfig) -> Self {
        let mut registry = Self::new();
        for tool in DiagnosticTool::ALL {
            if let Some(cmd) = config.command_for(tool) {
                registry.register(Arc::new(CommandToolAdapter::from_config(tool, cmd)));
            }
        }
        registry
    }

    /// Register an adapter, replacing any previous one for the same tool.
    pub fn register(&mut self, adapter: Arc<dyn DiagnosticToolAdapter>) {
        self.adapters.insert(adapter.tool(), adapter);
    }

    /// Adapter for `tool`, or [`Error::UnknownTool`].
    pub fn resolve(&self, tool: DiagnosticTool) -> Result<Arc<dyn DiagnosticToolAdapter>> {
        self.adapters
            .get(&tool)
            .cloned()
            .ok_or(Error::UnknownTool(tool))
    }

    /// Tools with a registered adapter.
    pub fn tools(&self) -> Vec<DiagnosticTool> {
        let mut tools: Vec<_> = self.adapters.keys().copied().collect();
        tools.sort_by_key(|t| t.as_str());
        tools
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools())
            .finish()
    }
}
