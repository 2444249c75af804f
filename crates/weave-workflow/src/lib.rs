pub mod condition;
pub mod dag;
pub mod definition;
pub mod duration;
pub mod execution;
pub mod parser;

pub use condition::{evaluate, ConditionOutcome};
pub use dag::{Dag, DagNode};
pub use definition::{
    AgentRef, Condition, ExecutionConfig, Operator, RetryPolicy, Step, StepKind, Variable,
    Workflow,
};
pub use execution::{StepState, StepStatus, WorkflowExecution, WorkflowStatus};
