//! Tool Executor: hooks, permission, execution and the tool-state writes.
//!
//! Every invocation walks `pending -> running -> completed | error` on a
//! single part id. A call that never reaches a terminal state is rewritten by
//! [`interrupt_unfinished`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::arguments::ToolArguments;
use super::task::SubtaskRunner;
use super::tool::{MetadataSink, Tool, ToolContext};
use super::truncation::TruncationPolicy;
use super::types::ToolOutput;
use super::validation::validate_arguments;
use crate::error::{Result, SessionError};
use crate::hooks::{Hooks, ToolHookInput};
use crate::message::{
    now_ms, Extensions, Messages, MessageWithParts, Part, ToolPart, ToolState, ToolTimeCompleted,
    ToolTimeRange, ToolTimeStart,
};
use crate::permission::{PermissionGate, PermissionRequest, Ruleset};

/// Error text written onto a tool that was cut off mid-flight.
pub const INTERRUPTED_ERROR: &str = "Tool execution was interrupted";

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolRunOutcome {
    Completed,
    /// The tool ran (or failed validation) and reported an error.
    Failed,
    /// Permission was denied by a rule or rejected by the user.
    Rejected,
    Interrupted,
}

/// One tool call to run on behalf of an assistant message.
pub struct ToolInvocation {
    pub tool: Arc<dyn Tool>,
    /// The pending part already persisted for this call.
    pub part: ToolPart,
    pub agent: String,
    pub ruleset: Ruleset,
    pub cancel: CancellationToken,
    /// User-queued work skips the permission prompt.
    pub skip_permission: bool,
}

#[derive(Clone)]
pub struct ToolExecutor {
    messages: Messages,
    gate: PermissionGate,
    hooks: Hooks,
    truncation: TruncationPolicy,
    subtasks: Option<Arc<dyn SubtaskRunner>>,
}

impl ToolExecutor {
    pub fn new(messages: Messages, gate: PermissionGate, hooks: Hooks, truncation: TruncationPolicy) -> Self {
        Self {
            messages,
            gate,
            hooks,
            truncation,
            subtasks: None,
        }
    }

    pub fn with_subtasks(mut self, runner: Arc<dyn SubtaskRunner>) -> Self {
        self.subtasks = Some(runner);
        self
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    /// Run one invocation to a terminal state and return the final part.
    pub async fn execute(&self, invocation: ToolInvocation) -> Result<(ToolPart, ToolRunOutcome)> {
        let ToolInvocation {
            tool,
            mut part,
            agent,
            ruleset,
            cancel,
            skip_permission,
        } = invocation;
        let hook_input = ToolHookInput {
            tool: part.tool.clone(),
            session_id: part.base.session_id.clone(),
            call_id: part.call_id.clone(),
        };

        let mut input = part.state.input().clone();
        self.hooks.tool_execute_before(&hook_input, &mut input).await;

        let start = now_ms();
        part.state = ToolState::Running {
            input: input.clone(),
            title: None,
            metadata: Extensions::new(),
            time: ToolTimeStart { start },
        };
        self.messages.update_part(&Part::Tool(part.clone())).await?;

        if let Err(message) = validate_arguments(&input, &tool.parameters().schema) {
            let error = format!(
                "The {} tool was called with invalid arguments: {message}. Please rewrite the input so it satisfies the expected schema.",
                part.tool
            );
            return self.fail(part, error, start, ToolRunOutcome::Failed).await;
        }
        let args = ToolArguments::new(input.clone());

        if !skip_permission {
            let mut request = PermissionRequest::new(
                part.base.session_id.clone(),
                tool.permission(),
                tool.permission_patterns(&args),
            );
            request.message_id = Some(part.base.message_id.clone());
            request.call_id = Some(part.call_id.clone());
            request.allow_always = tool.allow_always();
            request.metadata = serde_json::json!({ "tool": part.tool, "input": input });
            match self.gate.ask(request, &ruleset, &cancel).await {
                Ok(()) => {}
                Err(SessionError::Aborted) => {
                    return self.fail(part, INTERRUPTED_ERROR.into(), start, ToolRunOutcome::Interrupted).await
                }
                Err(err @ (SessionError::PermissionDenied { .. } | SessionError::PermissionRejected { .. })) => {
                    return self.fail(part, err.to_string(), start, ToolRunOutcome::Rejected).await
                }
                Err(err) => return Err(err),
            }
        }

        let ctx = ToolContext::new(
            part.base.session_id.clone(),
            part.base.message_id.clone(),
            part.call_id.clone(),
            agent,
            cancel.clone(),
        )
        .with_metadata_sink(self.metadata_sink(&part, start))
        .with_subtasks(self.subtasks.clone());

        tracing::debug!(session_id = %part.base.session_id, tool = %part.tool, call_id = %part.call_id, "executing tool");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Aborted),
            result = tool.execute(args, ctx) => result,
        };

        let mut output = match result {
            Ok(output) => output,
            Err(SessionError::Aborted) => {
                return self.fail(part, INTERRUPTED_ERROR.into(), start, ToolRunOutcome::Interrupted).await
            }
            Err(err) => {
                tracing::debug!(tool = %part.tool, error = %err, "tool failed");
                return self.fail(part, error_text(err), start, ToolRunOutcome::Failed).await;
            }
        };

        self.hooks.tool_execute_after(&hook_input, &mut output).await;
        let ToolOutput {
            title,
            output,
            metadata,
            attachments,
        } = output;
        part.state = ToolState::Completed {
            input,
            output: self.truncation.apply(&output),
            title,
            metadata,
            time: ToolTimeCompleted {
                start,
                end: now_ms(),
                compacted: None,
            },
            attachments,
        };
        self.messages.update_part(&Part::Tool(part.clone())).await?;
        Ok((part, ToolRunOutcome::Completed))
    }

    /// Record a call to a tool that is not available in this step.
    pub async fn reject_unavailable(&self, mut part: ToolPart, available: &[String]) -> Result<ToolPart> {
        let start = now_ms();
        part.state = ToolState::Running {
            input: part.state.input().clone(),
            title: None,
            metadata: Extensions::new(),
            time: ToolTimeStart { start },
        };
        self.messages.update_part(&Part::Tool(part.clone())).await?;
        let error = format!(
            "Model tried to call unavailable tool '{}'. Available tools: {}.",
            part.tool,
            if available.is_empty() { "none".to_string() } else { available.join(", ") }
        );
        let (part, _) = self.fail(part, error, start, ToolRunOutcome::Failed).await?;
        Ok(part)
    }

    async fn fail(
        &self,
        mut part: ToolPart,
        error: String,
        start: u64,
        outcome: ToolRunOutcome,
    ) -> Result<(ToolPart, ToolRunOutcome)> {
        let (input, metadata) = match part.state {
            ToolState::Running { input, metadata, .. } => (input, metadata),
            other => (other.input().clone(), Extensions::new()),
        };
        part.state = ToolState::Error {
            input,
            error,
            metadata,
            time: ToolTimeRange { start, end: now_ms() },
        };
        self.messages.update_part(&Part::Tool(part.clone())).await?;
        Ok((part, outcome))
    }

    fn metadata_sink(&self, part: &ToolPart, start: u64) -> MetadataSink {
        let messages = self.messages.clone();
        let part = part.clone();
        Arc::new(move |title, metadata| {
            let messages = messages.clone();
            let mut part = part.clone();
            Box::pin(async move {
                part.state = ToolState::Running {
                    input: part.state.input().clone(),
                    title,
                    metadata,
                    time: ToolTimeStart { start },
                };
                messages.update_part(&Part::Tool(part)).await
            })
        })
    }
}

fn error_text(err: SessionError) -> String {
    match err {
        SessionError::ToolExecution { message, .. } => message,
        other => other.to_string(),
    }
}

/// Rewrite every non-terminal tool part of `message` to an interrupted error.
/// Pending parts pass through `running` so the stored progression stays legal.
pub async fn interrupt_unfinished(messages: &Messages, message: &MessageWithParts) -> Result<usize> {
    let mut rewritten = 0;
    for part in message.tool_parts() {
        if part.state.is_terminal() {
            continue;
        }
        let mut part = part.clone();
        let now = now_ms();
        let start = part.state.started_at().unwrap_or(now);
        let input = part.state.input().clone();
        if matches!(part.state, ToolState::Pending { .. }) {
            part.state = ToolState::Running {
                input: input.clone(),
                title: None,
                metadata: Extensions::new(),
                time: ToolTimeStart { start },
            };
            messages.update_part(&Part::Tool(part.clone())).await?;
        }
        let metadata = match &part.state {
            ToolState::Running { metadata, .. } => metadata.clone(),
            _ => Extensions::new(),
        };
        part.state = ToolState::Error {
            input,
            error: INTERRUPTED_ERROR.to_string(),
            metadata,
            time: ToolTimeRange { start, end: now },
        };
        messages.update_part(&Part::Tool(part)).await?;
        rewritten += 1;
    }
    if rewritten > 0 {
        tracing::debug!(message_id = %message.id(), rewritten, "interrupted unfinished tool calls");
    }
    Ok(rewritten)
}
