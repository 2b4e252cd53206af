//! User and assistant message records.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::now_ms;
use crate::error::MessageError;
use crate::id::{self, Prefix};
use crate::models::ModelRef;
use crate::types::{FinishReason, Usage};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageTime {
    pub created: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
}

impl MessageTime {
    pub fn now() -> Self {
        Self {
            created: now_ms(),
            completed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserMessage {
    pub id: String,
    pub session_id: String,
    pub time: MessageTime,
    pub agent: String,
    pub model: ModelRef,
    /// Extra system prompt for turns answering this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Per-message tool enablement overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<HashMap<String, bool>>,
}

impl UserMessage {
    pub fn new(session_id: impl Into<String>, agent: impl Into<String>, model: ModelRef) -> Self {
        Self {
            id: id::ascending(Prefix::Message),
            session_id: session_id.into(),
            time: MessageTime::now(),
            agent: agent.into(),
            model,
            system: None,
            tools: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePath {
    pub cwd: String,
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantMessage {
    pub id: String,
    pub session_id: String,
    /// The user message this turn answers.
    pub parent_id: String,
    pub time: MessageTime,
    pub agent: String,
    /// Agent that actually produced the content (differs for subtasks and compaction).
    pub mode: String,
    pub model: ModelRef,
    #[serde(default)]
    pub path: MessagePath,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tokens: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
    /// Produced by compaction.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
}

impl AssistantMessage {
    pub fn new(parent: &UserMessage, agent: impl Into<String>, model: ModelRef) -> Self {
        let agent = agent.into();
        Self {
            id: id::ascending(Prefix::Message),
            session_id: parent.session_id.clone(),
            parent_id: parent.id.clone(),
            time: MessageTime::now(),
            mode: agent.clone(),
            agent,
            model,
            path: MessagePath::default(),
            cost: 0.0,
            tokens: Usage::default(),
            finish: None,
            error: None,
            summary: false,
        }
    }

    /// A finish reason has been recorded.
    pub fn is_finished(&self) -> bool {
        self.finish.is_some()
    }

    /// Finished with a reason that needs no follow-up step.
    pub fn ends_turn(&self) -> bool {
        self.finish.is_some_and(FinishReason::ends_turn)
    }

    pub fn complete(&mut self) {
        self.time.completed = Some(now_ms());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageInfo {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl MessageInfo {
    pub fn id(&self) -> &str {
        match self {
            Self::User(msg) => &msg.id,
            Self::Assistant(msg) => &msg.id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::User(msg) => &msg.session_id,
            Self::Assistant(msg) => &msg.session_id,
        }
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Self::User(msg) => Some(msg),
            Self::Assistant(_) => None,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(msg) => Some(msg),
            Self::User(_) => None,
        }
    }
}

impl From<UserMessage> for MessageInfo {
    fn from(msg: UserMessage) -> Self {
        Self::User(msg)
    }
}

impl From<AssistantMessage> for MessageInfo {
    fn from(msg: AssistantMessage) -> Self {
        Self::Assistant(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserMessage {
        UserMessage::new("ses_1", "build", ModelRef::new("test", "m"))
    }

    #[test]
    fn assistant_points_at_parent() {
        let user = user();
        let assistant = AssistantMessage::new(&user, "build", user.model.clone());
        assert_eq!(assistant.parent_id, user.id);
        assert_eq!(assistant.session_id, "ses_1");
        assert!(assistant.id > user.id);
        assert!(!assistant.is_finished());
    }

    #[test]
    fn tool_calls_finish_does_not_end_turn() {
        let user = user();
        let mut assistant = AssistantMessage::new(&user, "build", user.model.clone());
        assistant.finish = Some(FinishReason::ToolCalls);
        assert!(assistant.is_finished());
        assert!(!assistant.ends_turn());
        assistant.finish = Some(FinishReason::Stop);
        assert!(assistant.ends_turn());
    }

    #[test]
    fn info_is_tagged_by_role() {
        let value = serde_json::to_value(MessageInfo::from(user())).unwrap();
        assert_eq!(value["role"], "user");
        assert_eq!(value["agent"], "build");
    }
}
