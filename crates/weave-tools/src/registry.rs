use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use weave_core::error::{Result, WeaveError};
use weave_core::traits::Tool;
use weave_core::types::{ToolContext, ToolResult};

/// Registry of available tools. Built explicitly and shared by `Arc`.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        debug!(tool = %name, "Tool registered");
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn with_tool(mut self, tool: impl Tool) -> Self {
        self.register(tool);
        self
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Union of the capabilities every tool advertises.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self.tools.values().flat_map(|t| t.capabilities()).collect();
        caps.sort();
        caps.dedup();
        caps
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name, bounded by its timeout and the context's
    /// cancellation token.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| WeaveError::ToolNotFound(name.to_string()))?;

        let timeout = Duration::from_secs(tool.timeout_secs());
        let cancel = ctx.cancel.clone();

        tokio::select! {
            _ = cancel.cancelled() => Err(WeaveError::Cancelled),
            res = tokio::time::timeout(timeout, tool.execute(input, ctx)) => match res {
                Ok(result) => result,
                Err(_) => Err(WeaveError::ToolExecution {
                    tool: name.to_string(),
                    message: format!("timed out after {}s", tool.timeout_secs()),
                }),
            },
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
