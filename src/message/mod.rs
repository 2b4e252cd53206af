//! Part/Message model: records, persistence service and history conversion.

pub mod convert;
pub mod info;
pub mod part;
pub mod store;

pub use convert::to_model_messages;
pub use info::{AssistantMessage, MessageInfo, MessagePath, MessageTime, UserMessage};
pub use part::*;
pub use store::Messages;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A message record together with its parts in replay order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageWithParts {
    pub info: MessageInfo,
    pub parts: Vec<Part>,
}

impl MessageWithParts {
    pub fn new(info: impl Into<MessageInfo>, parts: Vec<Part>) -> Self {
        Self {
            info: info.into(),
            parts,
        }
    }

    pub fn id(&self) -> &str {
        self.info.id()
    }

    /// Concatenated text of non-synthetic text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .filter(|part| !part.synthetic)
            .map(|part| part.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_compaction(&self) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(part, Part::Compaction(_)))
    }

    pub fn tool_parts(&self) -> impl Iterator<Item = &ToolPart> {
        self.parts.iter().filter_map(Part::as_tool)
    }
}

/// Drop history superseded by a completed compaction.
///
/// Walks newest to oldest and stops at the user message that requested a
/// compaction whose summary assistant has finished. The result is ascending.
pub fn filter_compacted(messages: Vec<MessageWithParts>) -> Vec<MessageWithParts> {
    let mut completed: HashSet<String> = HashSet::new();
    let mut kept = Vec::new();
    for message in messages.into_iter().rev() {
        let stop = match &message.info {
            MessageInfo::User(user) => completed.contains(&user.id) && message.has_compaction(),
            MessageInfo::Assistant(assistant) => {
                if assistant.summary && assistant.is_finished() && assistant.error.is_none() {
                    completed.insert(assistant.parent_id.clone());
                }
                false
            }
        };
        kept.push(message);
        if stop {
            break;
        }
    }
    kept.reverse();
    kept
}
