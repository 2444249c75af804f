pub mod agents;
pub mod directory;
pub mod executor;
pub mod lifecycle;
pub mod scheduler;
pub mod store;

pub use agents::DryRunAgent;
pub use directory::AgentRegistry;
pub use executor::WorkflowExecutor;
pub use lifecycle::{HistoryEntry, LifecycleTracker, TaskState};
pub use scheduler::{PassReport, Task, TaskScheduler};
pub use store::ExecutionStore;
