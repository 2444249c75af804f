use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weave_core::error::{Result, WeaveError};
use weave_core::traits::Agent;
use weave_core::types::{AgentOutput, StepRequest, ToolContext, ValueMap};

use crate::registry::ToolRegistry;

/// Agent that runs each step by calling the step's tool from a registry.
///
/// The tool input is the step's mapped inputs as a JSON object. An object
/// result becomes the step output as-is; anything else is stored under
/// `result`.
pub struct ToolAgent {
    name: String,
    tools: Arc<ToolRegistry>,
}

impl ToolAgent {
    pub fn new(name: impl Into<String>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            name: name.into(),
            tools,
        }
    }

    /// Capabilities to register this agent under.
    pub fn capabilities(&self) -> Vec<String> {
        self.tools.capabilities()
    }

    async fn run(&self, request: StepRequest, cancel: CancellationToken) -> Result<AgentOutput> {
        let tool = request
            .tool
            .clone()
            .ok_or_else(|| WeaveError::AgentExecution {
                agent: self.name.clone(),
                message: format!("step {} names no tool", request.step_id),
            })?;

        let input = serde_json::Value::Object(request.inputs.clone().into_iter().collect());
        let ctx = ToolContext {
            execution_id: request.execution_id.clone(),
            step_id: request.step_id.clone(),
            cancel,
        };

        let started = Instant::now();
        debug!(agent = %self.name, tool = %tool, step = %request.step_id, "Invoking tool");
        let result = self.tools.execute(&tool, input, ctx).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut output = if result.is_error {
            let message = match &result.content {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            AgentOutput::failure(message)
        } else {
            AgentOutput::success(into_output(result.content))
        };
        output.duration_ms = duration_ms;
        output.metadata.insert("tool".into(), tool);
        Ok(output)
    }
}

fn into_output(content: serde_json::Value) -> ValueMap {
    match content {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        other => ValueMap::from([("result".to_string(), other)]),
    }
}

impl Agent for ToolAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(self.run(request, cancel))
    }
}
