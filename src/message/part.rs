//! Parts: the ordered, append-only content units of a message.
//!
//! Part ids ascend within a message and id order is replay order. A tool
//! part is the only kind rewritten in place, and only along
//! `pending -> running -> completed | error`.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, IntoStaticStr};

use super::now_ms;
use crate::error::{MessageError, Result};
use crate::id::{self, Prefix};
use crate::models::ModelRef;
use crate::types::{FinishReason, Usage};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartBase {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
}

impl PartBase {
    pub fn new(session_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            id: id::ascending(Prefix::Part),
            session_id: session_id.into(),
            message_id: message_id.into(),
        }
    }
}

/// Typed, forward-compatible metadata carried by a part.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extensions(BTreeMap<String, Value>);

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        self.0.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn insert_value(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Typed read. A present value of the wrong shape reads as `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn extend(&mut self, other: Extensions) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<serde_json::Map<String, Value>> for Extensions {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartTime {
    pub start: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

impl PartTime {
    pub fn started() -> Self {
        Self {
            start: now_ms(),
            end: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text(TextPart),
    Reasoning(ReasoningPart),
    File(FilePart),
    Tool(ToolPart),
    Subtask(SubtaskPart),
    Compaction(CompactionPart),
    StepStart(StepStartPart),
    StepFinish(StepFinishPart),
    Retry(RetryPart),
    Agent(AgentPart),
    Snapshot(SnapshotPart),
    Patch(PatchPart),
}

impl Part {
    pub fn base(&self) -> &PartBase {
        match self {
            Part::Text(part) => &part.base,
            Part::Reasoning(part) => &part.base,
            Part::File(part) => &part.base,
            Part::Tool(part) => &part.base,
            Part::Subtask(part) => &part.base,
            Part::Compaction(part) => &part.base,
            Part::StepStart(part) => &part.base,
            Part::StepFinish(part) => &part.base,
            Part::Retry(part) => &part.base,
            Part::Agent(part) => &part.base,
            Part::Snapshot(part) => &part.base,
            Part::Patch(part) => &part.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut PartBase {
        match self {
            Part::Text(part) => &mut part.base,
            Part::Reasoning(part) => &mut part.base,
            Part::File(part) => &mut part.base,
            Part::Tool(part) => &mut part.base,
            Part::Subtask(part) => &mut part.base,
            Part::Compaction(part) => &mut part.base,
            Part::StepStart(part) => &mut part.base,
            Part::StepFinish(part) => &mut part.base,
            Part::Retry(part) => &mut part.base,
            Part::Agent(part) => &mut part.base,
            Part::Snapshot(part) => &mut part.base,
            Part::Patch(part) => &mut part.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }

    pub fn session_id(&self) -> &str {
        &self.base().session_id
    }

    pub fn message_id(&self) -> &str {
        &self.base().message_id
    }

    /// The `type` tag of this part.
    pub fn kind(&self) -> &'static str {
        match self {
            Part::Text(_) => "text",
            Part::Reasoning(_) => "reasoning",
            Part::File(_) => "file",
            Part::Tool(_) => "tool",
            Part::Subtask(_) => "subtask",
            Part::Compaction(_) => "compaction",
            Part::StepStart(_) => "step-start",
            Part::StepFinish(_) => "step-finish",
            Part::Retry(_) => "retry",
            Part::Agent(_) => "agent",
            Part::Snapshot(_) => "snapshot",
            Part::Patch(_) => "patch",
        }
    }

    pub fn as_tool(&self) -> Option<&ToolPart> {
        match self {
            Part::Tool(part) => Some(part),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextPart> {
        match self {
            Part::Text(part) => Some(part),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextPart {
    #[serde(flatten)]
    pub base: PartBase,
    pub text: String,
    /// Generated by the runtime rather than typed by the user. Model-visible.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,
    /// Shown to the user but never sent to the model.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<PartTime>,
    #[serde(default, skip_serializing_if = "Extensions::is_empty")]
    pub metadata: Extensions,
}

impl TextPart {
    pub fn new(session_id: &str, message_id: &str, text: impl Into<String>) -> Self {
        Self {
            base: PartBase::new(session_id, message_id),
            text: text.into(),
            synthetic: false,
            ignored: false,
            time: None,
            metadata: Extensions::new(),
        }
    }

    pub fn synthetic(session_id: &str, message_id: &str, text: impl Into<String>) -> Self {
        Self {
            synthetic: true,
            ..Self::new(session_id, message_id, text)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningPart {
    #[serde(flatten)]
    pub base: PartBase,
    pub text: String,
    pub time: PartTime,
    #[serde(default, skip_serializing_if = "Extensions::is_empty")]
    pub metadata: Extensions,
}

/// Where a file part came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FileSource {
    File { path: String },
    Resource { client_name: String, uri: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilePart {
    #[serde(flatten)]
    pub base: PartBase,
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<FileSource>,
}

impl FilePart {
    pub fn is_directory(&self) -> bool {
        self.mime == DIRECTORY_MIME
    }
}

pub const DIRECTORY_MIME: &str = "application/x-directory";

/// Lifecycle status of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolTimeStart {
    pub start: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolTimeRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolTimeCompleted {
    pub start: u64,
    pub end: u64,
    /// Set once pruning cleared the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolState {
    Pending {
        input: Value,
        raw: String,
    },
    Running {
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Extensions::is_empty")]
        metadata: Extensions,
        time: ToolTimeStart,
    },
    Completed {
        input: Value,
        output: String,
        title: String,
        #[serde(default, skip_serializing_if = "Extensions::is_empty")]
        metadata: Extensions,
        time: ToolTimeCompleted,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<FilePart>,
    },
    Error {
        input: Value,
        error: String,
        #[serde(default, skip_serializing_if = "Extensions::is_empty")]
        metadata: Extensions,
        time: ToolTimeRange,
    },
}

impl ToolState {
    pub fn pending() -> Self {
        Self::Pending {
            input: Value::Object(Default::default()),
            raw: String::new(),
        }
    }

    pub fn status(&self) -> ToolStatus {
        match self {
            Self::Pending { .. } => ToolStatus::Pending,
            Self::Running { .. } => ToolStatus::Running,
            Self::Completed { .. } => ToolStatus::Completed,
            Self::Error { .. } => ToolStatus::Error,
        }
    }

    pub fn input(&self) -> &Value {
        match self {
            Self::Pending { input, .. }
            | Self::Running { input, .. }
            | Self::Completed { input, .. }
            | Self::Error { input, .. } => input,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }

    /// Completed with the output cleared by pruning.
    pub fn is_compacted(&self) -> bool {
        matches!(self, Self::Completed { time, .. } if time.compacted.is_some())
    }

    /// Start time, once execution has begun.
    pub fn started_at(&self) -> Option<u64> {
        match self {
            Self::Pending { .. } => None,
            Self::Running { time, .. } => Some(time.start),
            Self::Completed { time, .. } => Some(time.start),
            Self::Error { time, .. } => Some(time.start),
        }
    }

    /// Whether overwriting `self` with `next` is a legal progression.
    /// Pending may be refreshed while arguments stream in, and running may be
    /// refreshed with metadata updates.
    pub fn can_transition_to(&self, next: &ToolState) -> bool {
        use ToolStatus::*;
        matches!(
            (self.status(), next.status()),
            (Pending, Pending) | (Pending, Running) | (Running, Running) | (Running, Completed) | (Running, Error)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolPart {
    #[serde(flatten)]
    pub base: PartBase,
    pub call_id: String,
    pub tool: String,
    pub state: ToolState,
    #[serde(default, skip_serializing_if = "Extensions::is_empty")]
    pub metadata: Extensions,
}

impl ToolPart {
    pub fn pending(
        session_id: &str,
        message_id: &str,
        call_id: impl Into<String>,
        tool: impl Into<String>,
    ) -> Self {
        Self {
            base: PartBase::new(session_id, message_id),
            call_id: call_id.into(),
            tool: tool.into(),
            state: ToolState::pending(),
            metadata: Extensions::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtaskPart {
    #[serde(flatten)]
    pub base: PartBase,
    pub prompt: String,
    pub description: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompactionPart {
    #[serde(flatten)]
    pub base: PartBase,
    /// Enqueued by overflow detection rather than requested by the user.
    pub auto: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepStartPart {
    #[serde(flatten)]
    pub base: PartBase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepFinishPart {
    #[serde(flatten)]
    pub base: PartBase,
    pub reason: FinishReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    pub cost: f64,
    pub tokens: Usage,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryTime {
    pub created: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPart {
    #[serde(flatten)]
    pub base: PartBase,
    pub attempt: u32,
    pub error: MessageError,
    pub time: RetryTime,
}

/// Span of mention text inside the prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextSpan {
    pub value: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentPart {
    #[serde(flatten)]
    pub base: PartBase,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TextSpan>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotPart {
    #[serde(flatten)]
    pub base: PartBase,
    pub snapshot: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchPart {
    #[serde(flatten)]
    pub base: PartBase,
    pub hash: String,
    pub files: Vec<String>,
}
