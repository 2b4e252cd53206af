//! Convenience re-exports for common use.

pub use crate::agent::{AgentInfo, AgentMode, AgentRegistry};
pub use crate::agent_loop::{SessionLoop, SessionLoopBuilder};
pub use crate::bus::{Bus, BusEvent};
pub use crate::config::LoopConfig;
pub use crate::error::{MessageError, Result, SessionError};
pub use crate::hooks::{Hooks, Plugin};
pub use crate::message::{MessageInfo, MessageWithParts, Part, ToolState};
pub use crate::models::{ModelInfo, ModelRef};
pub use crate::permission::{PermissionAction, PermissionReply, PermissionRequest, Ruleset};
pub use crate::prompt::{PartInput, PromptInput};
pub use crate::provider::{ModelInvoker, ScriptedModel, ScriptedTurn};
pub use crate::storage::{FileStorage, MemoryStorage, Storage};
pub use crate::tools::{FunctionTool, Tool, ToolArguments, ToolOutput, ToolParameters};
pub use crate::types::{FinishReason, GenerationSettings, ModelMessage, Usage};
