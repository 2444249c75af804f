pub mod registry;
pub mod tool_agent;

pub use registry::ToolRegistry;
pub use tool_agent::ToolAgent;
