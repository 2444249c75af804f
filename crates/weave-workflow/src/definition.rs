use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weave_core::types::ValueMap;

/// A workflow definition: named steps wired together by `depends_on`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<AgentRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub config: ExecutionConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            steps: Vec::new(),
            agents: Vec::new(),
            variables: Vec::new(),
            config: ExecutionConfig::default(),
            metadata: BTreeMap::new(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    /// Find a top-level step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

/// An agent the workflow expects to be available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRef {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A declared workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, alias = "default", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Variable {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: String::new(),
            default_value: None,
            required: true,
            description: String::new(),
        }
    }

    pub fn with_default(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            kind: String::new(),
            default_value: Some(value),
            required: false,
            description: String::new(),
        }
    }
}

/// Workflow-wide execution settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Retry budget for task steps without their own `retry` block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Upper bound for the whole run.
    #[serde(
        default,
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Run the steps of a level concurrently.
    #[serde(default)]
    pub parallel_execution: bool,
    /// Keep going after a step fails.
    #[serde(default)]
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    #[default]
    Task,
    Condition,
    Parallel,
    Sequential,
}

impl StepKind {
    pub fn is_container(self) -> bool {
        matches!(self, Self::Parallel | Self::Sequential)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Task => "task",
            Self::Condition => "condition",
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
        };
        f.write_str(s)
    }
}

/// One unit of work in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, rename = "type")]
    pub kind: StepKind,
    /// Explicit agent to run on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Tool the step needs; also the capability used for agent selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: ValueMap,
    /// Step-local name to context key (or literal) mapping.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
    /// Output field to context key mapping.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(
        default,
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Children of a `parallel` or `sequential` step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            kind,
            agent: None,
            tool: None,
            depends_on: Vec::new(),
            config: ValueMap::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            conditions: Vec::new(),
            retry: None,
            timeout: None,
            metadata: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Task)
    }

    pub fn condition(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Condition)
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, expr: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), expr.into());
        self
    }

    pub fn with_output(mut self, field: impl Into<String>, target: impl Into<String>) -> Self {
        self.outputs.insert(field.into(), target.into());
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_children(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Step ids a condition step may branch to, in declaration order.
    pub fn branch_targets(&self) -> Vec<&str> {
        let mut targets = Vec::new();
        for c in &self.conditions {
            for t in [c.then.as_deref(), c.otherwise.as_deref()].into_iter().flatten() {
                if !targets.contains(&t) {
                    targets.push(t);
                }
            }
        }
        targets
    }
}

/// Comparison used by a condition predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "eq", alias = "==")]
    Eq,
    #[serde(rename = "ne", alias = "!=")]
    Ne,
    #[serde(rename = "gt", alias = ">")]
    Gt,
    #[serde(rename = "lt", alias = "<")]
    Lt,
    #[serde(rename = "gte", alias = ">=")]
    Gte,
    #[serde(rename = "lte", alias = "<=")]
    Lte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "contains")]
    Contains,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Contains => "contains",
        };
        f.write_str(s)
    }
}

/// `variable <operator> value`, selecting `then` when true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<String>,
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<String>,
}

impl Condition {
    pub fn new(variable: impl Into<String>, operator: Operator, value: serde_json::Value) -> Self {
        Self {
            variable: variable.into(),
            operator,
            value,
            then: None,
            otherwise: None,
        }
    }

    pub fn then(mut self, step: impl Into<String>) -> Self {
        self.then = Some(step.into());
        self
    }

    pub fn otherwise(mut self, step: impl Into<String>) -> Self {
        self.otherwise = Some(step.into());
        self
    }
}

/// Retry behavior for a failing task step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_retry_max")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default, with = "crate::duration")]
    pub delay: Duration,
    /// Multiplier applied to the delay after each retry.
    #[serde(default = "default_backoff")]
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_retry_max(),
            delay: Duration::ZERO,
            backoff: default_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            backoff: default_backoff(),
        }
    }

    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay before retry number `retry` (1-based), capped at one hour.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry <= 1 || self.delay.is_zero() {
            return self.delay;
        }
        let factor = self.backoff.max(1.0).powi(retry as i32 - 1);
        Duration::try_from_secs_f64(self.delay.as_secs_f64() * factor)
            .map_or(MAX_RETRY_DELAY, |d| d.min(MAX_RETRY_DELAY))
    }
}

const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

fn default_retry_max() -> u32 {
    3
}

fn default_backoff() -> f64 {
    2.0
}
