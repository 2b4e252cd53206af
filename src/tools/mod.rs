//! Tool system: trait, registry, executor and the delegation tool.

pub mod arguments;
pub mod executor;
pub mod registry;
pub mod task;
pub mod tool;
pub mod truncation;
pub mod types;
pub mod validation;

pub use arguments::ToolArguments;
pub use executor::{interrupt_unfinished, ToolExecutor, ToolInvocation, ToolRunOutcome, INTERRUPTED_ERROR};
pub use registry::{definitions, ResolvedTools, ToolProvider, ToolRegistry, ToolScope};
pub use task::{SubtaskRequest, SubtaskResult, SubtaskRunner, TaskTool, TASK_TOOL};
pub use tool::{FunctionTool, MetadataSink, Tool, ToolContext};
pub use truncation::{truncate_head, TruncationPolicy, TruncationResult};
pub use types::{ParameterBuilder, ToolOutput, ToolParameters};
pub use validation::validate_arguments;
