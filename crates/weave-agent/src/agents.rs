use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use weave_core::error::Result;
use weave_core::traits::Agent;
use weave_core::types::{AgentOutput, StepRequest};

/// Agent that reports what it was asked to do without doing it.
///
/// Backs agents declared in config so a workflow can be walked end to end
/// before real executors exist. Mapped inputs are passed through.
pub struct DryRunAgent {
    name: String,
}

impl DryRunAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn describe(&self, request: &StepRequest) -> String {
        let mut message = format!("Task '{}' executed by {}", request.step_name, self.name);
        if let Some(tool) = &request.tool {
            message.push_str(&format!(" (using tool: {tool})"));
        }
        message
    }
}

impl Agent for DryRunAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        request: StepRequest,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(async move {
            let mut output = request.inputs.clone();
            output.insert("message".into(), serde_json::json!(self.describe(&request)));
            let mut out = AgentOutput::success(output);
            out.metadata.insert("dry_run".into(), "true".into());
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_test_utils::step_request;

    #[tokio::test]
    async fn test_describes_step_and_passes_inputs() {
        let agent = DryRunAgent::new("analyst");
        let mut req = step_request("fetch");
        req.tool = Some("http".into());
        req.inputs.insert("url".into(), serde_json::json!("https://example.org"));

        let out = agent.execute(req, CancellationToken::new()).await.unwrap();
        assert!(out.is_success());
        assert_eq!(
            out.output["message"],
            "Task 'fetch' executed by analyst (using tool: http)"
        );
        assert_eq!(out.output["url"], "https://example.org");
    }
}
