pub mod config;
pub mod executor;
pub mod registry;
pub mod tool;

pub use config::{ExternalToolConfig, ToolTransport};
pub use executor::{ToolCallExecutor, ToolCallRequest, ToolCallResult, ToolOutcome};
pub use registry::{ToolDefinition, ToolRegistry};
pub use tool::{DynamicTool, Tool};
