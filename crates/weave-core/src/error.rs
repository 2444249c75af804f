use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeaveError {
    // Definition errors
    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("Dependency cycle detected among steps: {}", .remaining.join(", "))]
    Cycle { remaining: Vec<String> },

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Workflow parse error: {0}")]
    Parse(String),

    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Assignment errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent {agent} is not available (status: {status})")]
    AgentUnavailable { agent: String, status: String },

    #[error("No available agent matches the request")]
    NoAgentAvailable,

    #[error("Agent already registered: {0}")]
    AgentAlreadyRegistered(String),

    // Execution errors
    #[error("Step {step} failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Agent {agent} failed: {message}")]
    AgentExecution { agent: String, message: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    // Timeout and cancellation
    #[error("Step {step} timed out after {timeout_ms}ms")]
    StepTimeout { step: String, timeout_ms: u64 },

    #[error("Workflow {workflow} timed out after {timeout_ms}ms")]
    WorkflowTimeout { workflow: String, timeout_ms: u64 },

    #[error("Event publish timed out after {timeout_ms}ms: {event}")]
    PublishTimeout { event: String, timeout_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    // State errors
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already exists: {0}")]
    DuplicateTask(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Cannot {action} {id} in state {state}")]
    InvalidState {
        id: String,
        state: String,
        action: String,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used by callers to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The workflow or its inputs are malformed; nothing was executed.
    Definition,
    /// No agent could take the work; scheduler retries apply.
    Assignment,
    /// A step, agent or tool failed while running.
    Execution,
    /// A deadline elapsed or the caller cancelled.
    Timeout,
    /// Unknown record or illegal state transition.
    State,
    Config,
    Io,
    Serialization,
}

impl WeaveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateStep(_)
            | Self::UnknownStep(_)
            | Self::UnknownDependency { .. }
            | Self::Cycle { .. }
            | Self::InvalidDefinition(_)
            | Self::Parse(_)
            | Self::MissingInput(_)
            | Self::InvalidInput(_) => ErrorKind::Definition,
            Self::AgentNotFound(_)
            | Self::AgentUnavailable { .. }
            | Self::NoAgentAvailable
            | Self::AgentAlreadyRegistered(_) => ErrorKind::Assignment,
            Self::StepFailed { .. }
            | Self::AgentExecution { .. }
            | Self::ToolNotFound(_)
            | Self::ToolExecution { .. } => ErrorKind::Execution,
            Self::StepTimeout { .. }
            | Self::WorkflowTimeout { .. }
            | Self::PublishTimeout { .. }
            | Self::Cancelled => ErrorKind::Timeout,
            Self::TaskNotFound(_)
            | Self::DuplicateTask(_)
            | Self::ExecutionNotFound(_)
            | Self::InvalidState { .. } => ErrorKind::State,
            Self::Config(_) | Self::ConfigNotFound(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Serialization,
        }
    }

    pub fn invalid_state(
        id: impl Into<String>,
        state: impl std::fmt::Display,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            id: id.into(),
            state: state.to_string(),
            action: action.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WeaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_steps() {
        let err = WeaveError::Cycle {
            remaining: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected among steps: a, b");
        assert_eq!(err.kind(), ErrorKind::Definition);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(WeaveError::NoAgentAvailable.kind(), ErrorKind::Assignment);
        assert_eq!(WeaveError::Cancelled.kind(), ErrorKind::Timeout);
        assert_eq!(
            WeaveError::invalid_state("t1", "completed", "cancel").kind(),
            ErrorKind::State
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(WeaveError::from(io).kind(), ErrorKind::Io);
    }

    #[test]
    fn test_invalid_state_message() {
        let err = WeaveError::invalid_state("t1", "completed", "cancel");
        assert_eq!(err.to_string(), "Cannot cancel t1 in state completed");
    }
}
