//! Conversion of stored history into model-facing messages.

use serde_json::Value;

use super::{MessageInfo, MessageWithParts, Part, ToolState};
use crate::types::{AgentToolCall, AgentToolResult, ContentPart, FileContent, ModelMessage, Role};

pub const COMPACTED_OUTPUT: &str = "[Old tool result content cleared]";
pub const INTERRUPTED_OUTPUT: &str = "[Tool execution was interrupted]";
const COMPACTION_QUESTION: &str = "What did we do so far?";
const SUBTASK_NOTE: &str = "The following tool was executed by the user";

/// Convert history into the message list sent to the model.
///
/// Ignored text and files already inlined as text are dropped. Every tool
/// call is paired with a result, so a call left pending or running reads as
/// interrupted instead of dangling.
pub fn to_model_messages(messages: &[MessageWithParts]) -> Vec<ModelMessage> {
    let mut result = Vec::new();
    for message in messages {
        match &message.info {
            MessageInfo::User(_) => {
                let content = user_content(&message.parts);
                if !content.is_empty() {
                    result.push(ModelMessage::new(Role::User, content));
                }
            }
            MessageInfo::Assistant(assistant) => {
                if let Some(error) = &assistant.error {
                    let has_content = message
                        .parts
                        .iter()
                        .any(|part| matches!(part, Part::Text(_) | Part::Reasoning(_) | Part::Tool(_)));
                    if !(error.is_aborted() && has_content) {
                        continue;
                    }
                }
                let (content, results) = assistant_content(&message.parts);
                if !content.is_empty() {
                    result.push(ModelMessage::new(Role::Assistant, content));
                }
                if !results.is_empty() {
                    result.push(ModelMessage::new(Role::Tool, results));
                }
            }
        }
    }
    result
}

fn user_content(parts: &[Part]) -> Vec<ContentPart> {
    let mut content = Vec::new();
    for part in parts {
        match part {
            Part::Text(text) if !text.ignored => content.push(ContentPart::text(&text.text)),
            Part::File(file) if file.mime != "text/plain" && !file.is_directory() => {
                content.push(ContentPart::File(FileContent {
                    url: file.url.clone(),
                    mime_type: file.mime.clone(),
                    filename: file.filename.clone(),
                }))
            }
            Part::Compaction(_) => content.push(ContentPart::text(COMPACTION_QUESTION)),
            Part::Subtask(_) => content.push(ContentPart::text(SUBTASK_NOTE)),
            _ => {}
        }
    }
    content
}

fn assistant_content(parts: &[Part]) -> (Vec<ContentPart>, Vec<ContentPart>) {
    let mut content = Vec::new();
    let mut results = Vec::new();
    for part in parts {
        match part {
            Part::Text(text) if !text.ignored => content.push(ContentPart::text(&text.text)),
            Part::Reasoning(reasoning) => content.push(ContentPart::Reasoning {
                text: reasoning.text.clone(),
            }),
            Part::Tool(tool) => {
                content.push(ContentPart::ToolCall(AgentToolCall {
                    id: tool.call_id.clone(),
                    name: tool.tool.clone(),
                    arguments: tool.state.input().clone(),
                }));
                let (output, is_error) = match &tool.state {
                    ToolState::Completed { output, time, .. } => {
                        let text = if time.compacted.is_some() {
                            COMPACTED_OUTPUT
                        } else {
                            output.as_str()
                        };
                        (text.to_string(), false)
                    }
                    ToolState::Error { error, .. } => (error.clone(), true),
                    ToolState::Pending { .. } | ToolState::Running { .. } => {
                        (INTERRUPTED_OUTPUT.to_string(), true)
                    }
                };
                results.push(ContentPart::ToolResult(AgentToolResult {
                    tool_call_id: tool.call_id.clone(),
                    tool_name: tool.tool.clone(),
                    result: Value::String(output),
                    is_error,
                }));
                if let ToolState::Completed {
                    attachments, time, ..
                } = &tool.state
                {
                    if time.compacted.is_none() {
                        results.extend(attachments.iter().map(|file| {
                            ContentPart::File(FileContent {
                                url: file.url.clone(),
                                mime_type: file.mime.clone(),
                                filename: file.filename.clone(),
                            })
                        }));
                    }
                }
            }
            _ => {}
        }
    }
    (content, results)
}
