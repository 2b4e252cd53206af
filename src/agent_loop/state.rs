//! Backward scan of a session's history and the state it implies.

use crate::message::{AssistantMessage, CompactionPart, MessageInfo, MessageWithParts, Part, SubtaskPart, UserMessage};

/// Where the loop stands before a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Normal,
    SubtaskPending,
    CompactionPending,
    OverflowDetected,
    Done,
}

/// Work queued on user messages the loop has not answered yet.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingTask {
    Subtask(SubtaskPart),
    Compaction(CompactionPart),
}

impl PendingTask {
    /// The user message the task was queued on.
    pub fn message_id(&self) -> &str {
        match self {
            Self::Subtask(part) => &part.base.message_id,
            Self::Compaction(part) => &part.base.message_id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopScan {
    pub last_user: Option<UserMessage>,
    pub last_assistant: Option<AssistantMessage>,
    pub last_finished: Option<AssistantMessage>,
    /// Most recent first.
    pub tasks: Vec<PendingTask>,
}

impl LoopScan {
    /// Walk `messages` (ascending) newest first. Tasks are collected from
    /// messages newer than the latest finished assistant.
    pub fn scan(messages: &[MessageWithParts]) -> Self {
        let mut scan = Self::default();
        for message in messages.iter().rev() {
            match &message.info {
                MessageInfo::User(user) => {
                    if scan.last_user.is_none() {
                        scan.last_user = Some(user.clone());
                    }
                }
                MessageInfo::Assistant(assistant) => {
                    if scan.last_assistant.is_none() {
                        scan.last_assistant = Some(assistant.clone());
                    }
                    if scan.last_finished.is_none() && assistant.is_finished() {
                        scan.last_finished = Some(assistant.clone());
                    }
                }
            }
            if scan.last_user.is_some() && scan.last_finished.is_some() {
                break;
            }
            for part in &message.parts {
                match part {
                    Part::Subtask(subtask) => scan.tasks.push(PendingTask::Subtask(subtask.clone())),
                    Part::Compaction(compaction) => scan.tasks.push(PendingTask::Compaction(compaction.clone())),
                    _ => {}
                }
            }
        }
        scan
    }

    /// The latest assistant ended its turn after the latest user message.
    pub fn is_done(&self) -> bool {
        match (&self.last_user, &self.last_assistant) {
            (Some(user), Some(assistant)) => assistant.ends_turn() && user.id < assistant.id,
            _ => false,
        }
    }

    pub fn next_task(&self) -> Option<&PendingTask> {
        self.tasks.first()
    }

    /// Classify the scan. `overflowed` is asked about the latest finished
    /// assistant only when it is not itself a summary.
    pub fn state<F>(&self, overflowed: F) -> LoopState
    where
        F: FnOnce(&AssistantMessage) -> bool,
    {
        if self.is_done() {
            return LoopState::Done;
        }
        match self.next_task() {
            Some(PendingTask::Subtask(_)) => return LoopState::SubtaskPending,
            Some(PendingTask::Compaction(_)) => return LoopState::CompactionPending,
            None => {}
        }
        match &self.last_finished {
            Some(finished) if !finished.summary && overflowed(finished) => LoopState::OverflowDetected,
            _ => LoopState::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PartBase, TextPart};
    use crate::models::ModelRef;
    use crate::types::FinishReason;

    fn user() -> MessageWithParts {
        let info = UserMessage::new("ses_1", "build", ModelRef::new("test", "m"));
        let text = Part::Text(TextPart::new("ses_1", &info.id, "hi"));
        MessageWithParts::new(info, vec![text])
    }

    fn reply(parent: &MessageWithParts, finish: Option<FinishReason>) -> MessageWithParts {
        let parent = parent.info.as_user().cloned().unwrap();
        let mut info = AssistantMessage::new(&parent, "build", parent.model.clone());
        info.finish = finish;
        MessageWithParts::new(info, vec![])
    }

    #[test]
    fn fresh_prompt_is_normal() {
        let scan = LoopScan::scan(&[user()]);
        assert!(scan.last_assistant.is_none());
        assert_eq!(scan.state(|_| false), LoopState::Normal);
    }

    #[test]
    fn answered_prompt_is_done() {
        let question = user();
        let answer = reply(&question, Some(FinishReason::Stop));
        let scan = LoopScan::scan(&[question, answer]);
        assert_eq!(scan.state(|_| true), LoopState::Done);
    }

    #[test]
    fn tool_calls_finish_keeps_going() {
        let question = user();
        let answer = reply(&question, Some(FinishReason::ToolCalls));
        let scan = LoopScan::scan(&[question, answer]);
        assert_eq!(scan.state(|_| false), LoopState::Normal);
        let scan_overflow = scan.state(|_| true);
        assert_eq!(scan_overflow, LoopState::OverflowDetected);
    }

    #[test]
    fn queued_subtask_after_finished_reply_is_pending() {
        let first = user();
        let answer = reply(&first, Some(FinishReason::Stop));
        let mut second = user();
        let second_id = second.id().to_string();
        second.parts.push(Part::Subtask(SubtaskPart {
            base: PartBase::new("ses_1", &second_id),
            prompt: "look around".into(),
            description: "explore".into(),
            agent: "general".into(),
            model: None,
            command: None,
        }));
        let scan = LoopScan::scan(&[first, answer, second]);
        assert_eq!(scan.tasks.len(), 1);
        assert_eq!(scan.next_task().map(PendingTask::message_id), Some(second_id.as_str()));
        assert_eq!(scan.state(|_| false), LoopState::SubtaskPending);
    }

    #[test]
    fn tasks_older_than_finished_reply_are_ignored() {
        let mut first = user();
        let first_id = first.id().to_string();
        first.parts.push(Part::Compaction(CompactionPart {
            base: PartBase::new("ses_1", &first_id),
            auto: false,
        }));
        let answer = reply(&first, Some(FinishReason::Stop));
        let scan = LoopScan::scan(&[first, answer]);
        assert!(scan.tasks.is_empty());
    }
}
