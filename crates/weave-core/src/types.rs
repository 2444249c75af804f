use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Open record of dynamically typed values (requirements, inputs, outputs).
pub type ValueMap = BTreeMap<String, serde_json::Value>;

/// Scheduling priority. Higher variants are dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Status shared by scheduler tasks and lifecycle records.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Busy,
    Inactive,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Busy => "busy",
            Self::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

/// Directory entry describing a capability-tagged agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind: kind.into(),
            capabilities: BTreeSet::new(),
            endpoint: None,
            status: AgentStatus::Active,
            metadata: BTreeMap::new(),
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Number of `required` capabilities this agent advertises.
    pub fn overlap(&self, required: &[String]) -> usize {
        required
            .iter()
            .filter(|c| self.capabilities.contains(c.as_str()))
            .count()
    }
}

/// Work handed to an agent for one step attempt.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub execution_id: String,
    pub step_id: String,
    pub step_name: String,
    pub tool: Option<String>,
    /// Step-local inputs after mapping against the context.
    pub inputs: ValueMap,
    /// Workflow inputs plus every output published so far.
    pub context: ValueMap,
    pub config: ValueMap,
    pub attempt: u32,
}

/// What an agent reports back for one step attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    #[serde(default)]
    pub output: ValueMap,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AgentOutput {
    pub fn success(output: ValueMap) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: serde_json::Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: serde_json::Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: serde_json::Value::String(message.into()),
            is_error: true,
        }
    }
}

/// Context passed to a tool on each invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub execution_id: String,
    pub step_id: String,
    pub cancel: CancellationToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let mut p = vec![Priority::Low, Priority::Urgent, Priority::Normal, Priority::High];
        p.sort();
        assert_eq!(
            p,
            vec![Priority::Low, Priority::Normal, Priority::High, Priority::Urgent]
        );
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_agent_overlap() {
        let agent = AgentInfo::new("analyst", "worker").with_capabilities(["csv", "stats"]);
        assert_eq!(agent.overlap(&["csv".into(), "http".into()]), 1);
        assert_eq!(agent.overlap(&[]), 0);
        assert_eq!(agent.status, AgentStatus::Active);
    }

    #[test]
    fn test_priority_serde() {
        let p: Priority = serde_json::from_str("\"urgent\"").unwrap();
        assert_eq!(p, Priority::Urgent);
    }
}
