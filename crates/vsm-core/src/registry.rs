use std::collections::HashMap;
use std::sync::Arc;

use crate::tools::{Tool, ToolDescriptor};

/// Source of a registered tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolSource {
    BuiltIn,
    /// Reflected from the named remote RPC server.
    Mcp(String),
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    source: ToolSource,
}

/// Name → tool handle mapping owned by a capsule.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the descriptor's name. Replaces any previous entry.
    pub fn register(&mut self, tool: Arc<dyn Tool>, source: ToolSource) {
        let name = tool.descriptor().name;
        let _ = self.tools.insert(name, ToolEntry { tool, source });
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(&e.tool))
    }

    pub fn source(&self, name: &str) -> Option<&ToolSource> {
        self.tools.get(name).map(|e| &e.source)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descs: Vec<ToolDescriptor> =
            self.tools.values().map(|e| e.tool.descriptor()).collect();
        descs.sort_by(|a, b| a.name.cmp(&b.name));
        descs
    }

    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.values().map(|e| Arc::clone(&e.tool)).collect()
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}
