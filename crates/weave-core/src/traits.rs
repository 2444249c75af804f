use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::*;

/// Agent: runs one step attempt.
pub trait Agent: Send + Sync + 'static {
    /// Name the directory knows this agent by.
    fn name(&self) -> &str;

    /// Run a step. Implementations should watch `cancel` for long work.
    fn execute(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AgentOutput>>;
}

/// Agent directory: lookup and selection of registered agents.
pub trait AgentDirectory: Send + Sync + 'static {
    /// Look up an agent by name.
    fn get(&self, name: &str) -> Result<AgentInfo>;

    /// Active agent with the largest capability overlap.
    fn find_best_agent(&self, capabilities: &[String]) -> Result<AgentInfo>;

    /// First active agent.
    fn idle_agent(&self) -> Result<AgentInfo>;

    fn update_status(&self, name: &str, status: AgentStatus) -> Result<()>;

    /// Execution handle for a registered agent, if it has one.
    fn handle(&self, name: &str) -> Option<Arc<dyn Agent>>;
}

/// Tool: a unit of work an agent may delegate to.
pub trait Tool: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    /// Capabilities an agent wrapping this tool advertises.
    fn capabilities(&self) -> Vec<String> {
        vec![self.name().to_string()]
    }
}
