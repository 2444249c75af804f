//! Mocks and fixtures shared by the Weave test suites.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use weave_core::config::AppConfig;
use weave_core::error::{Result, WeaveError};
use weave_core::traits::{Agent, Tool};
use weave_core::types::{AgentOutput, StepRequest, ToolContext, ToolResult, ValueMap};
use weave_workflow::{ExecutionConfig, Step, Workflow};

// ── Tools ──────────────────────────────────────────────────────

/// Returns its input unchanged.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input back"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move { Ok(ToolResult::success(input)) })
    }
}

/// Always reports a tool-level error.
pub struct FailingTool;

impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Fail every call"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async { Ok(ToolResult::error("tool failed on purpose")) })
    }
}

/// Sleeps before answering; used for timeout and cancellation tests.
pub struct SleepTool {
    delay: Duration,
    timeout_secs: u64,
}

impl SleepTool {
    pub fn new(delay: Duration, timeout_secs: u64) -> Self {
        Self {
            delay,
            timeout_secs,
        }
    }
}

impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleep, then succeed"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(ToolResult::success(serde_json::json!({"slept_ms": delay.as_millis() as u64})))
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}

// ── Agents ─────────────────────────────────────────────────────

#[derive(Clone)]
enum Behavior {
    Echo,
    Fail(String),
    /// Fail this many calls, then echo.
    Flaky(usize),
    Slow(Duration),
}

/// Scriptable agent that records every step it is asked to run.
pub struct MockAgent {
    name: String,
    behavior: Behavior,
    outputs: BTreeMap<String, ValueMap>,
    calls: Mutex<Vec<String>>,
    attempts: AtomicUsize,
}

impl MockAgent {
    fn with_behavior(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            outputs: BTreeMap::new(),
            calls: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Succeeds, echoing its inputs plus `agent` and `step`.
    pub fn echo(name: &str) -> Self {
        Self::with_behavior(name, Behavior::Echo)
    }

    /// Reports failure on every call.
    pub fn failing(name: &str, message: &str) -> Self {
        Self::with_behavior(name, Behavior::Fail(message.to_string()))
    }

    /// Fails the first `failures` calls, then succeeds.
    pub fn flaky(name: &str, failures: usize) -> Self {
        Self::with_behavior(name, Behavior::Flaky(failures))
    }

    /// Sleeps for `delay` (or until cancelled) before succeeding.
    pub fn slow(name: &str, delay: Duration) -> Self {
        Self::with_behavior(name, Behavior::Slow(delay))
    }

    /// Add fixed output fields for one step id.
    pub fn with_step_output(mut self, step_id: &str, output: ValueMap) -> Self {
        self.outputs.insert(step_id.to_string(), output);
        self
    }

    /// Step ids this agent was called with, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn success(&self, request: &StepRequest) -> AgentOutput {
        let mut output = request.inputs.clone();
        output.insert("agent".into(), serde_json::json!(self.name));
        output.insert("step".into(), serde_json::json!(request.step_id));
        if let Some(extra) = self.outputs.get(&request.step_id) {
            output.extend(extra.clone());
        }
        AgentOutput::success(output)
    }

    async fn run(&self, request: StepRequest, cancel: CancellationToken) -> Result<AgentOutput> {
        self.calls.lock().push(request.step_id.clone());
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        match &self.behavior {
            Behavior::Echo => Ok(self.success(&request)),
            Behavior::Fail(msg) => Ok(AgentOutput::failure(msg.clone())),
            Behavior::Flaky(failures) if attempt < *failures => Err(WeaveError::AgentExecution {
                agent: self.name.clone(),
                message: format!("transient failure {}", attempt + 1),
            }),
            Behavior::Flaky(_) => Ok(self.success(&request)),
            Behavior::Slow(delay) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(WeaveError::Cancelled),
                    _ = tokio::time::sleep(*delay) => Ok(self.success(&request)),
                }
            }
        }
    }
}

impl Agent for MockAgent {
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

/// `Arc<MockAgent>` forwarding to the shared mock, so tests can keep a
/// handle for assertions after registering it.
pub struct SharedAgent(pub Arc<MockAgent>);

impl Agent for SharedAgent {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn execute(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<AgentOutput>> {
        self.0.execute(request, cancel)
    }
}

// ── Fixtures ───────────────────────────────────────────────────

/// Minimal request for exercising an agent directly.
pub fn step_request(step_id: &str) -> StepRequest {
    StepRequest {
        execution_id: "exec-test".into(),
        step_id: step_id.into(),
        step_name: step_id.into(),
        tool: None,
        inputs: ValueMap::new(),
        context: ValueMap::new(),
        config: ValueMap::new(),
        attempt: 1,
    }
}

/// `A`, `B`/`C` after `A`, `D` after both, all on `agent`.
pub fn diamond_workflow(agent: &str) -> Workflow {
    Workflow::new("diamond")
        .with_step(Step::task("A").with_agent(agent))
        .with_step(Step::task("B").with_agent(agent).depends_on(["A"]))
        .with_step(Step::task("C").with_agent(agent).depends_on(["A"]))
        .with_step(Step::task("D").with_agent(agent).depends_on(["B", "C"]))
}

/// Steps `s1 -> s2 -> ... -> sN`, all on `agent`.
pub fn linear_workflow(agent: &str, len: usize) -> Workflow {
    let mut wf = Workflow::new("linear");
    for i in 1..=len {
        let mut step = Step::task(format!("s{i}")).with_agent(agent);
        if i > 1 {
            step = step.depends_on([format!("s{}", i - 1)]);
        }
        wf = wf.with_step(step);
    }
    wf
}

pub fn parallel_config() -> ExecutionConfig {
    ExecutionConfig {
        parallel_execution: true,
        ..Default::default()
    }
}

/// Config with a short scheduler tick and publish timeout.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.scheduler.tick_interval_ms = 10;
    config.events.publish_timeout_ms = 100;
    config
}

/// Write `contents` to a temp file with the given suffix (e.g. `.json`).
pub fn temp_file(contents: &str, suffix: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("create temp file");
    file.write_all(contents.as_bytes()).expect("write temp file");
    file
}

pub fn values<const N: usize>(pairs: [(&str, serde_json::Value); N]) -> ValueMap {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
