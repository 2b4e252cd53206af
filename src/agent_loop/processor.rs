//! Step processor: one model call streamed into parts, then its tool calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::bus::BusEvent;
use crate::compaction::is_overflow;
use crate::config::LoopConfig;
use crate::error::{MessageError, Result, SessionError};
use crate::hooks::{ChatParamsInput, Hooks};
use crate::message::{
    now_ms, AssistantMessage, Extensions, MessageInfo, Messages, Part, PartBase, PartTime, ReasoningPart,
    RetryPart, RetryTime, StepFinishPart, StepStartPart, TextPart, ToolPart, ToolState,
};
use crate::models::ModelInfo;
use crate::permission::Ruleset;
use crate::provider::{ModelInvoker, ProviderRequest};
use crate::tools::{definitions, ResolvedTools, ToolExecutor, ToolInvocation, ToolRunOutcome};
use crate::types::{FinishReason, GenerationSettings, ModelMessage, StreamEvent};

/// What the loop should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Stop,
    /// Token usage overflowed the context; compact before the next step.
    Compact,
}

/// Everything one model call needs. The assistant message is already persisted.
pub struct StepRequest {
    pub assistant: AssistantMessage,
    pub model: ModelInfo,
    pub system: Vec<String>,
    pub messages: Vec<ModelMessage>,
    pub tools: ResolvedTools,
    pub settings: GenerationSettings,
    pub ruleset: Ruleset,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub assistant: AssistantMessage,
    pub outcome: StepOutcome,
}

/// Parts under construction while a stream is consumed.
#[derive(Default)]
struct StreamState {
    text: HashMap<String, TextPart>,
    reasoning: HashMap<String, ReasoningPart>,
    tools: HashMap<String, ToolPart>,
    /// Call ids with complete arguments, in arrival order.
    ready: Vec<String>,
    finish: Option<FinishReason>,
}

#[derive(Clone)]
pub struct StepProcessor {
    messages: Messages,
    invoker: Arc<dyn ModelInvoker>,
    executor: ToolExecutor,
    hooks: Hooks,
    config: Arc<LoopConfig>,
}

impl StepProcessor {
    pub fn new(
        messages: Messages,
        invoker: Arc<dyn ModelInvoker>,
        executor: ToolExecutor,
        hooks: Hooks,
        config: Arc<LoopConfig>,
    ) -> Self {
        Self {
            messages,
            invoker,
            executor,
            hooks,
            config,
        }
    }

    pub fn invoker(&self) -> &Arc<dyn ModelInvoker> {
        &self.invoker
    }

    /// Run one step. Model errors land on the assistant message and yield
    /// [`StepOutcome::Stop`]; cancellation returns [`SessionError::Aborted`].
    pub async fn process(&self, request: StepRequest) -> Result<StepResult> {
        let StepRequest {
            mut assistant,
            model,
            system,
            mut messages,
            tools,
            mut settings,
            ruleset,
            cancel,
        } = request;

        self.hooks.messages_transform(&mut messages).await;
        let params = ChatParamsInput {
            session_id: assistant.session_id.clone(),
            agent: assistant.agent.clone(),
            model: model.model.to_string(),
        };
        self.hooks.chat_params(&params, &mut settings).await;

        let provider_request = ProviderRequest {
            session_id: assistant.session_id.clone(),
            model: model.clone(),
            system,
            messages,
            tools: definitions(&tools),
            settings,
        };
        let policy = self.config.retry_policy();
        let mut attempt = 0u32;

        let state = loop {
            attempt += 1;
            let mut state = StreamState::default();
            let failure = self
                .consume(&mut assistant, &model, provider_request.clone(), &cancel, &mut state)
                .await?;
            let Some(error) = failure else {
                break state;
            };
            if error.is_aborted() || cancel.is_cancelled() {
                self.close_open_parts(&mut state).await?;
                return Err(SessionError::Aborted);
            }
            if error.is_retryable() && policy.should_retry(attempt) {
                let delay = policy.delay_for(attempt, error.retry_after_ms().map(Duration::from_millis));
                tracing::warn!(
                    session_id = %assistant.session_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "model call failed; retrying"
                );
                self.close_open_parts(&mut state).await?;
                self.messages
                    .update_part(&Part::Retry(RetryPart {
                        base: PartBase::new(&assistant.session_id, &assistant.id),
                        attempt,
                        error,
                        time: RetryTime { created: now_ms() },
                    }))
                    .await?;
                policy.wait(delay, &cancel).await?;
                continue;
            }

            tracing::warn!(session_id = %assistant.session_id, error = %error, "model call failed");
            self.close_open_parts(&mut state).await?;
            self.messages.bus().publish(BusEvent::SessionError {
                session_id: assistant.session_id.clone(),
                error: error.clone(),
            });
            assistant.error = Some(error);
            assistant.complete();
            self.messages.update_message(&MessageInfo::Assistant(assistant.clone())).await?;
            return Ok(StepResult {
                assistant,
                outcome: StepOutcome::Stop,
            });
        };

        let mut state = state;
        self.close_open_parts(&mut state).await?;
        let ran_tools = !state.ready.is_empty();
        let blocked = self.run_tools(&assistant, &mut state, &tools, &ruleset, &cancel).await?;
        if cancel.is_cancelled() {
            return Err(SessionError::Aborted);
        }

        assistant.finish = Some(state.finish.unwrap_or(if ran_tools {
            FinishReason::ToolCalls
        } else {
            FinishReason::Other
        }));
        assistant.complete();
        self.messages.update_message(&MessageInfo::Assistant(assistant.clone())).await?;

        let outcome = if blocked {
            StepOutcome::Stop
        } else if is_overflow(&assistant.tokens, &model, &self.config) {
            StepOutcome::Compact
        } else {
            StepOutcome::Continue
        };
        tracing::debug!(
            session_id = %assistant.session_id,
            message_id = %assistant.id,
            finish = ?assistant.finish,
            tokens = assistant.tokens.total(),
            ?outcome,
            "step finished"
        );
        Ok(StepResult { assistant, outcome })
    }

    /// Drain the model stream into parts. `Ok(Some(_))` is a model failure.
    async fn consume(
        &self,
        assistant: &mut AssistantMessage,
        model: &ModelInfo,
        request: ProviderRequest,
        cancel: &CancellationToken,
        state: &mut StreamState,
    ) -> Result<Option<MessageError>> {
        let mut stream = match self.invoker.stream(request, cancel.clone()).await {
            Ok(stream) => stream,
            Err(error) => return Ok(Some(error)),
        };
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Some(MessageError::aborted())),
                next = stream.next() => next,
            };
            match next {
                None => return Ok(None),
                Some(Err(error)) => return Ok(Some(error)),
                Some(Ok(event)) => self.apply(assistant, model, event, state).await?,
            }
        }
    }

    async fn apply(
        &self,
        assistant: &mut AssistantMessage,
        model: &ModelInfo,
        event: StreamEvent,
        state: &mut StreamState,
    ) -> Result<()> {
        let (sid, mid) = (assistant.session_id.clone(), assistant.id.clone());
        match event {
            StreamEvent::StepStart => {
                self.messages
                    .update_part(&Part::StepStart(StepStartPart {
                        base: PartBase::new(&sid, &mid),
                        snapshot: None,
                    }))
                    .await?;
            }
            StreamEvent::TextStart { id } => {
                let mut part = TextPart::new(&sid, &mid, "");
                part.time = Some(PartTime::started());
                self.messages.update_part(&Part::Text(part.clone())).await?;
                state.text.insert(id, part);
            }
            StreamEvent::TextDelta { id, text } => {
                let part = state.text.entry(id).or_insert_with(|| TextPart::new(&sid, &mid, ""));
                part.text.push_str(&text);
                self.messages.update_part_delta(&Part::Text(part.clone()), Some(text)).await?;
            }
            StreamEvent::TextEnd { id } => {
                if let Some(mut part) = state.text.remove(&id) {
                    part.text = part.text.trim_end().to_string();
                    part.time = Some(PartTime {
                        start: part.time.map(|t| t.start).unwrap_or_else(now_ms),
                        end: Some(now_ms()),
                    });
                    self.messages.update_part(&Part::Text(part)).await?;
                }
            }
            StreamEvent::ReasoningStart { id } => {
                let part = new_reasoning(&sid, &mid);
                self.messages.update_part(&Part::Reasoning(part.clone())).await?;
                state.reasoning.insert(id, part);
            }
            StreamEvent::ReasoningDelta { id, text } => {
                let part = state.reasoning.entry(id).or_insert_with(|| new_reasoning(&sid, &mid));
                part.text.push_str(&text);
                self.messages
                    .update_part_delta(&Part::Reasoning(part.clone()), Some(text))
                    .await?;
            }
            StreamEvent::ReasoningEnd { id } => {
                if let Some(mut part) = state.reasoning.remove(&id) {
                    part.text = part.text.trim_end().to_string();
                    part.time.end = Some(now_ms());
                    self.messages.update_part(&Part::Reasoning(part)).await?;
                }
            }
            StreamEvent::ToolInputStart { id, tool_name } => {
                let part = ToolPart::pending(&sid, &mid, id.clone(), tool_name);
                self.messages.update_part(&Part::Tool(part.clone())).await?;
                state.tools.insert(id, part);
            }
            StreamEvent::ToolInputDelta { id, delta } => {
                if let Some(part) = state.tools.get_mut(&id) {
                    if let ToolState::Pending { raw, .. } = &mut part.state {
                        raw.push_str(&delta);
                    }
                    self.messages.update_part(&Part::Tool(part.clone())).await?;
                }
            }
            StreamEvent::ToolCall(call) => {
                let part = state
                    .tools
                    .entry(call.id.clone())
                    .or_insert_with(|| ToolPart::pending(&sid, &mid, call.id.clone(), call.name.clone()));
                let raw = match &part.state {
                    ToolState::Pending { raw, .. } => raw.clone(),
                    _ => String::new(),
                };
                part.state = ToolState::Pending {
                    input: call.arguments,
                    raw,
                };
                self.messages.update_part(&Part::Tool(part.clone())).await?;
                state.ready.push(call.id);
            }
            StreamEvent::StepFinish { finish_reason, usage } => {
                let cost = model.cost.cost_of(&usage);
                assistant.cost += cost;
                assistant.tokens = usage;
                state.finish = Some(finish_reason);
                self.messages
                    .update_part(&Part::StepFinish(StepFinishPart {
                        base: PartBase::new(&sid, &mid),
                        reason: finish_reason,
                        snapshot: None,
                        cost,
                        tokens: usage,
                    }))
                    .await?;
                self.messages.update_message(&MessageInfo::Assistant(assistant.clone())).await?;
            }
        }
        Ok(())
    }

    /// Close text and reasoning parts the stream never ended.
    async fn close_open_parts(&self, state: &mut StreamState) -> Result<()> {
        let now = now_ms();
        for (_, mut part) in state.text.drain() {
            part.time = part.time.map(|t| PartTime { start: t.start, end: Some(now) });
            self.messages.update_part(&Part::Text(part)).await?;
        }
        for (_, mut part) in state.reasoning.drain() {
            part.time.end = Some(now);
            self.messages.update_part(&Part::Reasoning(part)).await?;
        }
        Ok(())
    }

    /// Execute ready calls concurrently. Returns whether a permission
    /// rejection should stop the loop.
    async fn run_tools(
        &self,
        assistant: &AssistantMessage,
        state: &mut StreamState,
        tools: &ResolvedTools,
        ruleset: &Ruleset,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let available: Vec<String> = tools.keys().cloned().collect();
        let available = &available;
        let calls = state
            .ready
            .iter()
            .filter_map(|call_id| state.tools.get(call_id).cloned())
            .map(|part| async move {
                match tools.get(&part.tool) {
                    Some(tool) => {
                        self.executor
                            .execute(ToolInvocation {
                                tool: tool.clone(),
                                part,
                                agent: assistant.agent.clone(),
                                ruleset: ruleset.clone(),
                                cancel: cancel.clone(),
                                skip_permission: false,
                            })
                            .await
                    }
                    None => self
                        .executor
                        .reject_unavailable(part, available)
                        .await
                        .map(|part| (part, ToolRunOutcome::Failed)),
                }
            });
        let mut blocked = false;
        for result in join_all(calls).await {
            let (_, outcome) = result?;
            if outcome == ToolRunOutcome::Rejected && !self.config.continue_on_deny {
                blocked = true;
            }
        }
        Ok(blocked)
    }
}

fn new_reasoning(session_id: &str, message_id: &str) -> ReasoningPart {
    ReasoningPart {
        base: PartBase::new(session_id, message_id),
        text: String::new(),
        time: PartTime::started(),
        metadata: Extensions::new(),
    }
}
