//! Compaction Engine: overflow detection, summary generation and pruning.
//!
//! Compaction never deletes history. A summary assistant message anchored at
//! the compaction user message hides earlier turns from the model (see
//! [`crate::message::filter_compacted`]); pruning later clears bulky tool
//! output while keeping the record that the call happened.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRegistry, COMPACTION_AGENT, COMPACTION_PROMPT};
use crate::agent_loop::processor::{StepProcessor, StepRequest};
use crate::config::LoopConfig;
use crate::error::{Result, SessionError};
use crate::message::convert::COMPACTED_OUTPUT;
use crate::message::{
    now_ms, to_model_messages, AssistantMessage, CompactionPart, MessageInfo, MessageWithParts, Part, PartBase,
    TextPart, ToolState, UserMessage,
};
use crate::models::{ModelInfo, ModelRef};
use crate::session::Sessions;
use crate::tools::ResolvedTools;
use crate::types::{GenerationSettings, ModelMessage, Usage};

const SUMMARY_REQUEST: &str = "Provide a detailed prompt for continuing our conversation above. \
Focus on information that would be helpful for continuing the conversation, including what we did, \
what we're doing, which files we're working on, and what we're going to do next considering new session \
will not have access to our conversation.";

pub const CONTINUE_PROMPT: &str = "Continue if you have next steps";

/// `true` when `tokens` exceed the usable context: the context limit minus
/// the configured reserve (or the model's output limit capped at
/// `output_token_max`). Unknown limits never overflow.
pub fn is_overflow(tokens: &Usage, model: &ModelInfo, config: &LoopConfig) -> bool {
    if !config.auto_compaction || model.context_limit == 0 {
        return false;
    }
    let reserve = config
        .overflow_reserve_tokens
        .unwrap_or_else(|| model.output_limit.min(config.output_token_max));
    tokens.total() > model.context_limit.saturating_sub(reserve)
}

/// Rough token estimate: four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    text.chars().count().div_ceil(4) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    Stop,
    Continue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub parts: usize,
    pub tokens: u64,
}

#[derive(Clone)]
pub struct CompactionEngine {
    sessions: Sessions,
    agents: AgentRegistry,
    processor: StepProcessor,
    config: Arc<LoopConfig>,
}

impl CompactionEngine {
    pub fn new(sessions: Sessions, agents: AgentRegistry, processor: StepProcessor, config: Arc<LoopConfig>) -> Self {
        Self {
            sessions,
            agents,
            processor,
            config,
        }
    }

    pub fn is_overflow(&self, tokens: &Usage, model: &ModelInfo) -> bool {
        is_overflow(tokens, model, &self.config)
    }

    /// Queue a compaction: a user message carrying a compaction part.
    pub async fn create(&self, session_id: &str, agent: &str, model: ModelRef, auto: bool) -> Result<MessageWithParts> {
        let info = UserMessage::new(session_id, agent, model);
        let part = Part::Compaction(CompactionPart {
            base: PartBase::new(session_id, &info.id),
            auto,
        });
        let messages = self.sessions.messages();
        messages.update_message(&MessageInfo::User(info.clone())).await?;
        messages.update_part(&part).await?;
        tracing::debug!(session_id, message_id = %info.id, auto, "compaction queued");
        Ok(MessageWithParts::new(info, vec![part]))
    }

    /// Summarize `history` into an assistant message anchored at `parent_id`.
    /// An automatic compaction appends a synthetic user message so the
    /// interrupted request carries on. The summary's id is pushed onto `created`.
    pub async fn process(
        &self,
        history: &[MessageWithParts],
        parent_id: &str,
        session_id: &str,
        cancel: &CancellationToken,
        created: &mut Vec<String>,
    ) -> Result<CompactionOutcome> {
        let parent_message = history
            .iter()
            .find(|message| message.id() == parent_id)
            .ok_or_else(|| SessionError::not_found("message", parent_id))?;
        let parent = parent_message
            .info
            .as_user()
            .cloned()
            .ok_or_else(|| SessionError::InvalidState(format!("compaction parent {parent_id} is not a user message")))?;
        let auto = parent_message
            .parts
            .iter()
            .any(|part| matches!(part, Part::Compaction(c) if c.auto));

        let agent = self.agents.get(COMPACTION_AGENT)?;
        let model_ref = agent.model.clone().unwrap_or_else(|| parent.model.clone());
        let model = self.processor.invoker().model(&model_ref).await?;

        let mut summary = AssistantMessage::new(&parent, COMPACTION_AGENT, model_ref);
        summary.mode = COMPACTION_AGENT.to_string();
        summary.summary = true;
        self.sessions
            .messages()
            .update_message(&MessageInfo::Assistant(summary.clone()))
            .await?;
        created.push(summary.id.clone());
        self.sessions.set_compacting(session_id, true).await?;

        let mut messages = to_model_messages(history);
        messages.push(ModelMessage::user(SUMMARY_REQUEST));
        let result = self
            .processor
            .process(StepRequest {
                assistant: summary,
                model,
                system: vec![agent.prompt.clone().unwrap_or_else(|| COMPACTION_PROMPT.to_string())],
                messages,
                tools: ResolvedTools::new(),
                settings: GenerationSettings::default(),
                ruleset: agent.permission.clone(),
                cancel: cancel.clone(),
            })
            .await;
        self.sessions.set_compacting(session_id, false).await?;
        let result = result?;

        if result.assistant.error.is_some() {
            tracing::warn!(session_id, "compaction failed");
            return Ok(CompactionOutcome::Stop);
        }
        tracing::debug!(session_id, message_id = %result.assistant.id, auto, "compaction finished");

        if auto {
            let info = UserMessage::new(session_id, &parent.agent, parent.model.clone());
            let part = Part::Text(TextPart::synthetic(session_id, &info.id, CONTINUE_PROMPT));
            let messages = self.sessions.messages();
            messages.update_message(&MessageInfo::User(info)).await?;
            messages.update_part(&part).await?;
        }
        Ok(CompactionOutcome::Continue)
    }

    /// Clear the output of old completed tool calls.
    ///
    /// The two most recent user turns are protected, and so is the newest
    /// `prune_protect_tokens` worth of tool output. Walking stops at a summary
    /// or at output that was already pruned. Nothing is written unless more
    /// than `prune_minimum_tokens` would be freed.
    pub async fn prune(&self, session_id: &str) -> Result<PruneReport> {
        if !self.config.prune {
            return Ok(PruneReport::default());
        }
        let history = self.sessions.messages().list(session_id).await?;

        let mut turns = 0;
        let mut total = 0u64;
        let mut pruned = 0u64;
        let mut candidates = Vec::new();
        'history: for message in history.iter().rev() {
            match &message.info {
                MessageInfo::User(_) => turns += 1,
                MessageInfo::Assistant(assistant) if assistant.summary && turns >= 2 => break,
                MessageInfo::Assistant(_) => {}
            }
            if turns < 2 {
                continue;
            }
            for part in message.parts.iter().rev() {
                let Part::Tool(tool) = part else {
                    continue;
                };
                let ToolState::Completed { output, time, .. } = &tool.state else {
                    continue;
                };
                if time.compacted.is_some() {
                    break 'history;
                }
                let estimate = estimate_tokens(output);
                total += estimate;
                if total > self.config.prune_protect_tokens {
                    pruned += estimate;
                    candidates.push(tool.clone());
                }
            }
        }

        if pruned <= self.config.prune_minimum_tokens {
            return Ok(PruneReport::default());
        }
        let now = now_ms();
        for mut tool in candidates.iter().cloned() {
            if let ToolState::Completed { output, time, .. } = &mut tool.state {
                *output = COMPACTED_OUTPUT.to_string();
                time.compacted = Some(now);
            }
            self.sessions.messages().update_part(&Part::Tool(tool)).await?;
        }
        tracing::debug!(session_id, parts = candidates.len(), tokens = pruned, "pruned tool output");
        Ok(PruneReport {
            parts: candidates.len(),
            tokens: pruned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelRef;

    fn model(context: u64, output: u64) -> ModelInfo {
        ModelInfo::new(ModelRef::new("test", "m"), context, output)
    }

    #[test]
    fn overflow_boundary_is_exclusive() {
        let config = LoopConfig::default().with_overflow_reserve_tokens(1_000);
        let info = model(10_000, 4_000);
        assert!(!is_overflow(&Usage::new(9_000, 0), &info, &config));
        assert!(is_overflow(&Usage::new(9_001, 0), &info, &config));
    }

    #[test]
    fn default_reserve_is_output_limit_capped() {
        let config = LoopConfig::default();
        let info = model(100_000, 50_000);
        // Reserve is min(50_000, 32_000) = 32_000.
        assert!(!is_overflow(&Usage::new(68_000, 0), &info, &config));
        assert!(is_overflow(&Usage::new(68_001, 0), &info, &config));
    }

    #[test]
    fn unknown_limit_or_disabled_never_overflows() {
        let usage = Usage::new(u64::MAX / 4, 0);
        assert!(!is_overflow(&usage, &model(0, 0), &LoopConfig::default()));
        let disabled = LoopConfig::default().with_auto_compaction(false);
        assert!(!is_overflow(&usage, &model(1_000, 100), &disabled));
    }

    #[test]
    fn estimates_four_chars_per_token() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
