//! Streaming types.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::generation::FinishReason;
use super::message::AgentToolCall;
use super::usage::Usage;
use crate::error::MessageError;

/// An incremental result from a model call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    StepStart,
    TextStart { id: String },
    TextDelta { id: String, text: String },
    TextEnd { id: String },
    ReasoningStart { id: String },
    ReasoningDelta { id: String, text: String },
    ReasoningEnd { id: String },
    /// The model started emitting arguments for a tool call.
    ToolInputStart { id: String, tool_name: String },
    ToolInputDelta { id: String, delta: String },
    /// Arguments are complete and the call can be executed.
    ToolCall(AgentToolCall),
    StepFinish {
        finish_reason: FinishReason,
        usage: Usage,
    },
}

/// Stream returned by the Model Invocation collaborator. Errors arrive
/// already normalized into the message taxonomy.
pub type ModelStream = BoxStream<'static, Result<StreamEvent, MessageError>>;
