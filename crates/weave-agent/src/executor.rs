use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weave_core::config::ExecutorConfig;
use weave_core::error::{Result, WeaveError};
use weave_core::traits::{Agent, AgentDirectory};
use weave_core::types::{AgentStatus, StepRequest, TaskStatus, ValueMap};
use weave_workflow::{
    condition, parser, Dag, ExecutionConfig, RetryPolicy, StepState, Step, StepKind, Workflow,
    WorkflowExecution,
};

use crate::lifecycle::LifecycleTracker;
use crate::store::ExecutionStore;

/// Runs workflows level by level over their dependency graph.
///
/// Definition problems (bad graph, missing required input) are returned as
/// errors before any step starts. Everything that happens once steps run is
/// reported through the returned [`WorkflowExecution`].
pub struct WorkflowExecutor {
    directory: Arc<dyn AgentDirectory>,
    lifecycle: Arc<LifecycleTracker>,
    store: Option<Arc<ExecutionStore>>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(directory: Arc<dyn AgentDirectory>, lifecycle: Arc<LifecycleTracker>) -> Self {
        Self {
            directory,
            lifecycle,
            store: None,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleTracker> {
        &self.lifecycle
    }

    pub async fn execute(
        &self,
        workflow: &Workflow,
        inputs: ValueMap,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecution> {
        let workflow = parser::normalize(workflow.clone())?;
        parser::validate(&workflow)?;
        let inputs = resolve_inputs(&workflow, inputs)?;

        let mut execution = WorkflowExecution::new(&workflow, inputs.clone());
        execution.start();
        let execution_id = execution.id.clone();
        let parallel = self
            .config
            .parallel_execution
            .unwrap_or(workflow.config.parallel_execution);

        info!(
            workflow = %workflow.name,
            execution_id = %execution_id,
            steps = workflow.steps.len(),
            parallel,
            "Workflow execution started"
        );
        self.save(&execution);
        self.track(&execution_id, inputs.clone(), TaskStatus::Running, "workflow started")
            .await;

        let token = cancel.child_token();
        let run = Run {
            executor: self,
            config: &workflow.config,
            execution_id: execution_id.clone(),
            cancel: token.clone(),
            timed_out: AtomicBool::new(false),
            execution: Mutex::new(execution),
            context: Mutex::new(inputs),
        };

        // On timeout the scope is cancelled and drained, so steps already
        // running still record their state.
        let outcome = {
            let mut scope = run.run_scope(&workflow.steps, None, parallel);
            match workflow.config.timeout {
                Some(limit) => match tokio::time::timeout(limit, &mut scope).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        run.timed_out.store(true, Ordering::SeqCst);
                        token.cancel();
                        scope.await;
                        ScopeOutcome::TimedOut(WeaveError::WorkflowTimeout {
                            workflow: workflow.name.clone(),
                            timeout_ms: limit.as_millis() as u64,
                        })
                    }
                },
                None => scope.await,
            }
        };

        let mut execution = run.execution.into_inner();
        let status = match outcome {
            ScopeOutcome::Finished { failed } => {
                if !failed.is_empty() {
                    execution
                        .metadata
                        .insert("failed_steps".into(), failed.join(","));
                }
                execution.mark_completed();
                TaskStatus::Completed
            }
            ScopeOutcome::Failed { step, error } => {
                execution.failed_step = Some(step.clone());
                execution.mark_failed(format!("step {step} failed: {error}"));
                TaskStatus::Failed
            }
            ScopeOutcome::Cancelled => {
                execution.mark_cancelled("execution cancelled");
                TaskStatus::Cancelled
            }
            ScopeOutcome::TimedOut(err) => {
                execution.mark_failed(err.to_string());
                TaskStatus::Failed
            }
        };

        match status {
            TaskStatus::Completed => info!(
                execution_id = %execution_id,
                duration_ms = execution.duration_ms.unwrap_or_default(),
                "Workflow execution completed"
            ),
            TaskStatus::Cancelled => warn!(
                execution_id = %execution_id,
                "Workflow execution cancelled"
            ),
            _ => error!(
                execution_id = %execution_id,
                failed_step = execution.failed_step.as_deref().unwrap_or("-"),
                error = execution.error.as_deref().unwrap_or_default(),
                "Workflow execution failed"
            ),
        }

        if let Some(error) = &execution.error {
            self.note(&execution_id, self.lifecycle.set_error(&execution_id, error.clone()));
        }
        self.note(
            &execution_id,
            self.lifecycle.set_output(&execution_id, execution.outputs.clone()),
        );
        self.finish(&execution_id, status, "workflow finished").await;
        self.save(&execution);
        Ok(execution)
    }

    fn save(&self, execution: &WorkflowExecution) {
        if let Some(store) = &self.store {
            store.save(execution);
        }
    }

    async fn track(&self, key: &str, input: ValueMap, status: TaskStatus, reason: &str) {
        if let Err(e) = self.lifecycle.create(key, input).await {
            warn!(task_id = %key, error = %e, "Lifecycle record not created");
            return;
        }
        self.finish(key, status, reason).await;
    }

    fn note(&self, key: &str, result: Result<()>) {
        if let Err(e) = result {
            warn!(task_id = %key, error = %e, "Lifecycle record not updated");
        }
    }

    async fn finish(&self, key: &str, status: TaskStatus, reason: &str) {
        if let Err(e) = self.lifecycle.transition(key, status, "executor", reason).await {
            warn!(task_id = %key, error = %e, "Lifecycle update rejected");
        }
    }

    fn resolve_agent(&self, step: &Step) -> Result<(String, Arc<dyn Agent>)> {
        let info = match &step.agent {
            Some(name) => {
                let info = self.directory.get(name)?;
                if info.status == AgentStatus::Inactive {
                    return Err(WeaveError::AgentUnavailable {
                        agent: info.name,
                        status: info.status.to_string(),
                    });
                }
                info
            }
            None => {
                let wanted: Vec<String> = step.tool.iter().cloned().collect();
                self.directory.find_best_agent(&wanted)?
            }
        };
        let handle = self
            .directory
            .handle(&info.name)
            .ok_or_else(|| WeaveError::AgentExecution {
                agent: info.name.clone(),
                message: "registered without an execution handle".into(),
            })?;
        Ok((info.name, handle))
    }
}

/// Apply variable defaults and reject missing required variables.
fn resolve_inputs(workflow: &Workflow, mut inputs: ValueMap) -> Result<ValueMap> {
    for var in &workflow.variables {
        if inputs.contains_key(&var.name) {
            continue;
        }
        match &var.default_value {
            Some(value) => {
                inputs.insert(var.name.clone(), value.clone());
            }
            None if var.required => return Err(WeaveError::MissingInput(var.name.clone())),
            None => {}
        }
    }
    Ok(inputs)
}

/// Resolve a step's input expressions against the context.
///
/// An expression names a context key, or `key.field` to reach into an
/// object value. Anything else is taken as a literal string.
fn map_inputs(step: &Step, context: &ValueMap) -> ValueMap {
    step.inputs
        .iter()
        .map(|(key, expr)| {
            let value = lookup(context, expr)
                .unwrap_or_else(|| serde_json::Value::String(expr.clone()));
            (key.clone(), value)
        })
        .collect()
}

fn lookup(context: &ValueMap, expr: &str) -> Option<serde_json::Value> {
    if let Some(v) = context.get(expr) {
        return Some(v.clone());
    }
    let (head, path) = expr.split_once('.')?;
    let mut current = context.get(head)?;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

fn scoped_id(prefix: Option<&str>, id: &str) -> String {
    match prefix {
        Some(p) => format!("{p}/{id}"),
        None => id.to_string(),
    }
}

enum StepOutcome {
    Completed,
    /// A condition step ran; `not_taken` are sibling ids to skip.
    Branched { not_taken: Vec<String> },
    Failed { step: String, error: String },
    Cancelled,
}

enum ScopeOutcome {
    Finished { failed: Vec<String> },
    Failed { step: String, error: String },
    Cancelled,
    TimedOut(WeaveError),
}

/// State shared by every step of one execution.
struct Run<'a> {
    executor: &'a WorkflowExecutor,
    config: &'a ExecutionConfig,
    execution_id: String,
    cancel: CancellationToken,
    /// Set when the workflow timeout cancelled `cancel`.
    timed_out: AtomicBool,
    execution: Mutex<WorkflowExecution>,
    context: Mutex<ValueMap>,
}

impl<'a> Run<'a> {
    fn key(&self, step_id: &str) -> String {
        format!("{}:{step_id}", self.execution_id)
    }

    fn record(&self, state: StepState) {
        let step_id = state.step_id.clone();
        if let Err(e) = self.execution.lock().record_step(state) {
            warn!(execution_id = %self.execution_id, step = %step_id, error = %e, "Step state dropped");
        }
    }

    /// Run one scope (the workflow or a container's children) level by level.
    fn run_scope<'s>(
        &'s self,
        steps: &'s [Step],
        prefix: Option<&'s str>,
        parallel: bool,
    ) -> BoxFuture<'s, ScopeOutcome> {
        Box::pin(async move {
            let dag = match Dag::build(steps) {
                Ok(dag) => dag,
                Err(e) => {
                    return ScopeOutcome::Failed {
                        step: prefix.unwrap_or("workflow").to_string(),
                        error: e.to_string(),
                    }
                }
            };
            let by_id: BTreeMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
            let mut skipped: BTreeMap<String, String> = BTreeMap::new();
            let mut failed = Vec::new();

            for (index, level) in dag.levels().into_iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return ScopeOutcome::Cancelled;
                }
                debug!(
                    execution_id = %self.execution_id,
                    scope = prefix.unwrap_or("root"),
                    level = index + 1,
                    steps = level.len(),
                    "Running level"
                );

                let mut runnable = Vec::new();
                for id in &level {
                    let full_id = scoped_id(prefix, id);
                    if let Some(reason) = skipped.get(id) {
                        self.skip(&full_id, reason).await;
                    } else if let Some(step) = by_id.get(id.as_str()) {
                        runnable.push((*step, full_id));
                    }
                }

                let outcomes: Vec<(String, StepOutcome)> = if parallel {
                    join_all(runnable.into_iter().map(|(step, full_id)| async move {
                        (step.id.clone(), self.run_step(step, full_id).await)
                    }))
                    .await
                } else {
                    let mut outcomes = Vec::new();
                    for (step, full_id) in runnable {
                        let outcome = self.run_step(step, full_id).await;
                        let stop = match &outcome {
                            StepOutcome::Failed { .. } => !self.config.continue_on_error,
                            StepOutcome::Cancelled => true,
                            _ => false,
                        };
                        outcomes.push((step.id.clone(), outcome));
                        if stop {
                            break;
                        }
                    }
                    outcomes
                };

                for (id, outcome) in outcomes {
                    match outcome {
                        StepOutcome::Completed => {}
                        StepOutcome::Branched { not_taken } => {
                            let reason = format!("branch not taken at {}", scoped_id(prefix, &id));
                            for target in not_taken {
                                let downstream = dag.downstream(&target);
                                for s in std::iter::once(target).chain(downstream) {
                                    skipped.entry(s).or_insert_with(|| reason.clone());
                                }
                            }
                        }
                        StepOutcome::Failed { step, error } => {
                            if self.config.continue_on_error {
                                warn!(execution_id = %self.execution_id, step = %step, error = %error, "Step failed, continuing");
                                failed.push(step);
                            } else {
                                return ScopeOutcome::Failed { step, error };
                            }
                        }
                        StepOutcome::Cancelled => return ScopeOutcome::Cancelled,
                    }
                }
            }
            ScopeOutcome::Finished { failed }
        })
    }

    async fn skip(&self, full_id: &str, reason: &str) {
        debug!(execution_id = %self.execution_id, step = %full_id, reason, "Step skipped");
        self.record(StepState::skipped(full_id, reason));
        self.executor
            .track(&self.key(full_id), ValueMap::new(), TaskStatus::Cancelled, reason)
            .await;
    }

    async fn run_step(&self, step: &Step, full_id: String) -> StepOutcome {
        if self.cancel.is_cancelled() {
            return StepOutcome::Cancelled;
        }

        let key = self.key(&full_id);
        let inputs = map_inputs(step, &self.context.lock());
        let mut state = StepState::new(&full_id);
        state.input = inputs.clone();
        state.start();
        self.executor
            .track(&key, inputs, TaskStatus::Running, "step started")
            .await;
        debug!(execution_id = %self.execution_id, step = %full_id, kind = %step.kind, "Step started");

        let mut branched = None;
        let result = match step.kind {
            StepKind::Task => self.run_task(step, &full_id, &mut state).await,
            StepKind::Condition => self.run_condition(step, &full_id).map(|(output, not_taken)| {
                branched = Some(not_taken);
                output
            }),
            StepKind::Parallel | StepKind::Sequential => {
                self.run_container(step, &full_id).await
            }
        };

        let lifecycle = self.executor.lifecycle();
        let outcome = match result {
            Ok(output) => {
                self.executor.note(&key, lifecycle.set_output(&key, output.clone()));
                state.complete(output);
                self.executor.finish(&key, TaskStatus::Completed, "step completed").await;
                info!(execution_id = %self.execution_id, step = %full_id, duration_ms = state.duration_ms, "Step completed");
                match branched {
                    Some(not_taken) => StepOutcome::Branched { not_taken },
                    None => StepOutcome::Completed,
                }
            }
            Err(mut failure) => {
                if self.timed_out.load(Ordering::SeqCst) {
                    failure.error = "workflow timed out".into();
                }
                self.executor.note(&key, lifecycle.set_error(&key, failure.error.clone()));
                state.fail(failure.error.clone());
                self.executor.finish(&key, TaskStatus::Failed, "step failed").await;
                warn!(execution_id = %self.execution_id, step = %full_id, error = %failure.error, "Step failed");
                if self.cancel.is_cancelled() {
                    StepOutcome::Cancelled
                } else {
                    StepOutcome::Failed {
                        step: failure.step.unwrap_or_else(|| full_id.clone()),
                        error: failure.error,
                    }
                }
            }
        };
        self.record(state);
        outcome
    }

    async fn run_task(
        &self,
        step: &Step,
        full_id: &str,
        state: &mut StepState,
    ) -> std::result::Result<ValueMap, Failure> {
        let policy = step.retry.clone().or_else(|| {
            self.config
                .max_retries
                .map(|n| RetryPolicy::new(n, Duration::ZERO))
        });
        let max_retries = policy.as_ref().map_or(0, |p| p.max_retries);
        let timeout = step
            .timeout
            .or_else(|| self.executor.config.default_step_timeout());

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.attempt(step, full_id, state, attempt, timeout).await {
                Ok(output) => {
                    self.publish(step, full_id, &output);
                    return Ok(output);
                }
                Err(err) => err,
            };

            state.log(format!("attempt {attempt} failed: {err}"));
            let retries_left = attempt <= max_retries;
            if !retries_left || self.cancel.is_cancelled() || matches!(err, WeaveError::Cancelled) {
                return Err(Failure::new(err.to_string()));
            }

            state.retry_count = attempt;
            let delay = policy
                .as_ref()
                .map_or(Duration::ZERO, |p| p.delay_for(attempt));
            warn!(
                execution_id = %self.execution_id,
                step = %full_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Step attempt failed, retrying"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Failure::new(WeaveError::Cancelled.to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        step: &Step,
        full_id: &str,
        state: &mut StepState,
        attempt: u32,
        timeout: Option<Duration>,
    ) -> Result<ValueMap> {
        let (name, agent) = self.executor.resolve_agent(step)?;
        state.agent_used = Some(name.clone());

        let context = self.context.lock().clone();
        let request = StepRequest {
            execution_id: self.execution_id.clone(),
            step_id: full_id.to_string(),
            step_name: if step.name.is_empty() {
                step.id.clone()
            } else {
                step.name.clone()
            },
            tool: step.tool.clone(),
            inputs: state.input.clone(),
            context,
            config: step.config.clone(),
            attempt,
        };

        let call = agent.execute(request, self.cancel.child_token());
        let bounded = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(WeaveError::StepTimeout {
                        step: full_id.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    }),
                },
                None => call.await,
            }
        };
        // Agents that ignore their token are abandoned on cancellation.
        let output = tokio::select! {
            _ = self.cancel.cancelled() => return Err(WeaveError::Cancelled),
            result = bounded => result?,
        };

        match output.error {
            Some(message) => Err(WeaveError::AgentExecution {
                agent: name,
                message,
            }),
            None => Ok(output.output),
        }
    }

    /// Write a task's outputs into the shared context.
    ///
    /// Without an output mapping the whole output object is published under
    /// the step id; otherwise each mapped field is published under its target.
    fn publish(&self, step: &Step, full_id: &str, output: &ValueMap) {
        let mut published = ValueMap::new();
        if step.outputs.is_empty() {
            let object: serde_json::Map<String, serde_json::Value> =
                output.clone().into_iter().collect();
            published.insert(full_id.to_string(), serde_json::Value::Object(object));
        } else {
            for (field, target) in &step.outputs {
                match output.get(field) {
                    Some(value) => {
                        published.insert(target.clone(), value.clone());
                    }
                    None => debug!(step = %full_id, field = %field, "Mapped output field missing"),
                }
            }
        }
        self.context.lock().extend(published.clone());
        self.execution.lock().outputs.extend(published);
    }

    fn run_condition(
        &self,
        step: &Step,
        full_id: &str,
    ) -> std::result::Result<(ValueMap, Vec<String>), Failure> {
        let context = self.context.lock().clone();
        let outcome = condition::evaluate(full_id, &step.conditions, &context)
            .map_err(|e| Failure::new(e.to_string()))?;

        let not_taken: Vec<String> = step
            .branch_targets()
            .into_iter()
            .filter(|t| outcome.branch.as_deref() != Some(*t))
            .map(str::to_string)
            .collect();
        debug!(
            step = %full_id,
            branch = outcome.branch.as_deref().unwrap_or("-"),
            skipped = not_taken.len(),
            "Condition evaluated"
        );

        let mut output = ValueMap::new();
        output.insert("branch".into(), serde_json::json!(outcome.branch));
        output.insert("matched".into(), serde_json::json!(outcome.matched));
        Ok((output, not_taken))
    }

    async fn run_container(
        &self,
        step: &Step,
        full_id: &str,
    ) -> std::result::Result<ValueMap, Failure> {
        if step.steps.is_empty() {
            return Ok(ValueMap::new());
        }
        let parallel = step.kind == StepKind::Parallel;
        match self.run_scope(&step.steps, Some(full_id), parallel).await {
            ScopeOutcome::Finished { failed } if failed.is_empty() => {
                let mut output = ValueMap::new();
                output.insert("steps".into(), serde_json::json!(step.steps.len()));
                Ok(output)
            }
            ScopeOutcome::Finished { failed } => Err(Failure::new(format!(
                "child steps failed: {}",
                failed.join(", ")
            ))),
            ScopeOutcome::Failed { step, error } => Err(Failure {
                step: Some(step),
                error,
            }),
            ScopeOutcome::Cancelled => Err(Failure::new(WeaveError::Cancelled.to_string())),
            ScopeOutcome::TimedOut(err) => Err(Failure::new(err.to_string())),
        }
    }
}

/// A step failure, optionally attributed to a nested child step.
struct Failure {
    step: Option<String>,
    error: String,
}

impl Failure {
    fn new(error: impl Into<String>) -> Self {
        Self {
            step: None,
            error: error.into(),
        }
    }
}
