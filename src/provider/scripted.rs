//! Queue-driven [`ModelInvoker`] for tests and offline runs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{ModelInvoker, ProviderRequest};
use crate::error::{MessageError, Result, SessionError};
use crate::id::{self, Prefix};
use crate::models::{ModelInfo, ModelRef};
use crate::types::{AgentToolCall, FinishReason, ModelStream, StreamEvent, Usage};

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream `text` and finish with `stop`.
    Text { text: String, usage: Usage },
    /// Request tool calls and finish with `tool-calls`.
    ToolCalls {
        calls: Vec<AgentToolCall>,
        usage: Usage,
    },
    /// Emit raw events verbatim.
    Events(Vec<std::result::Result<StreamEvent, MessageError>>),
    /// Fail before streaming starts.
    Fail(MessageError),
    /// Emit a text start, then wait until cancelled.
    Hang,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            usage: Usage::new(10, 5),
        }
    }

    pub fn text_with_usage(text: impl Into<String>, usage: Usage) -> Self {
        Self::Text {
            text: text.into(),
            usage,
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self::ToolCalls {
            calls: vec![AgentToolCall {
                id: id::ascending(Prefix::Call),
                name: name.into(),
                arguments,
            }],
            usage: Usage::new(10, 5),
        }
    }
}

#[derive(Default)]
struct Script {
    turns: VecDeque<ScriptedTurn>,
    requests: Vec<ProviderRequest>,
}

/// Plays back queued [`ScriptedTurn`]s in order and records every request.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    models: Arc<Mutex<HashMap<ModelRef, ModelInfo>>>,
    script: Arc<Mutex<Script>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(self, info: ModelInfo) -> Self {
        self.register(info);
        self
    }

    pub fn register(&self, info: ModelInfo) {
        if let Ok(mut models) = self.models.lock() {
            models.insert(info.model.clone(), info);
        }
    }

    pub fn push(&self, turn: ScriptedTurn) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.turns.push_back(turn);
        }
        self
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.script
            .lock()
            .map(|script| script.requests.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script
            .lock()
            .map(|script| script.turns.len())
            .unwrap_or_default()
    }

    fn next_turn(&self, request: ProviderRequest) -> Option<ScriptedTurn> {
        let mut script = self.script.lock().ok()?;
        script.requests.push(request);
        script.turns.pop_front()
    }
}

fn text_events(text: String, usage: Usage) -> Vec<std::result::Result<StreamEvent, MessageError>> {
    let id = id::ascending(Prefix::Part);
    let mut events = vec![Ok(StreamEvent::StepStart), Ok(StreamEvent::TextStart { id: id.clone() })];
    // Split into a couple of deltas so consumers exercise buffer appends.
    let mid = text
        .char_indices()
        .nth(text.chars().count() / 2)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let (head, tail) = text.split_at(mid);
    for chunk in [head, tail] {
        if !chunk.is_empty() {
            events.push(Ok(StreamEvent::TextDelta {
                id: id.clone(),
                text: chunk.to_string(),
            }));
        }
    }
    events.push(Ok(StreamEvent::TextEnd { id }));
    events.push(Ok(StreamEvent::StepFinish {
        finish_reason: FinishReason::Stop,
        usage,
    }));
    events
}

fn tool_events(
    calls: Vec<AgentToolCall>,
    usage: Usage,
) -> Vec<std::result::Result<StreamEvent, MessageError>> {
    let mut events = vec![Ok(StreamEvent::StepStart)];
    for call in calls {
        events.push(Ok(StreamEvent::ToolInputStart {
            id: call.id.clone(),
            tool_name: call.name.clone(),
        }));
        events.push(Ok(StreamEvent::ToolInputDelta {
            id: call.id.clone(),
            delta: call.arguments.to_string(),
        }));
        events.push(Ok(StreamEvent::ToolCall(call)));
    }
    events.push(Ok(StreamEvent::StepFinish {
        finish_reason: FinishReason::ToolCalls,
        usage,
    }));
    events
}

#[async_trait]
impl ModelInvoker for ScriptedModel {
    async fn model(&self, model: &ModelRef) -> Result<ModelInfo> {
        self.models
            .lock()
            .ok()
            .and_then(|models| models.get(model).cloned())
            .ok_or_else(|| SessionError::not_found("model", model.to_string()))
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<ModelStream, MessageError> {
        let turn = self
            .next_turn(request)
            .ok_or_else(|| MessageError::unknown("scripted model has no turns left"))?;
        let events = match turn {
            ScriptedTurn::Text { text, usage } => text_events(text, usage),
            ScriptedTurn::ToolCalls { calls, usage } => tool_events(calls, usage),
            ScriptedTurn::Events(events) => events,
            ScriptedTurn::Fail(error) => return Err(error),
            ScriptedTurn::Hang => {
                let stream = async_stream::stream! {
                    yield Ok(StreamEvent::StepStart);
                    yield Ok(StreamEvent::TextStart { id: id::ascending(Prefix::Part) });
                    cancel.cancelled().await;
                    yield Err(MessageError::aborted());
                };
                return Ok(stream.boxed());
            }
        };
        Ok(futures::stream::iter(events).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GenerationSettings;

    fn request(model: &ModelInfo) -> ProviderRequest {
        ProviderRequest {
            session_id: "ses_1".into(),
            model: model.clone(),
            system: vec![],
            messages: vec![],
            tools: vec![],
            settings: GenerationSettings::default(),
        }
    }

    #[tokio::test]
    async fn plays_turns_in_order() {
        let info = ModelInfo::new(ModelRef::new("test", "m"), 1000, 100);
        let model = ScriptedModel::new().with_model(info.clone());
        model.push(ScriptedTurn::text("hello world"));
        model.push(ScriptedTurn::Fail(MessageError::auth("test", "no key")));

        let events: Vec<_> = model
            .stream(request(&info), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        let text: String = events
            .iter()
            .filter_map(|event| match event {
                Ok(StreamEvent::TextDelta { text, .. }) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello world");

        let err = model
            .stream(request(&info), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MessageError::AuthRequired { .. }));
        assert_eq!(model.requests().len(), 2);
        assert_eq!(model.remaining(), 0);
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let model = ScriptedModel::new();
        let err = model.model(&ModelRef::new("x", "y")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound { kind: "model", .. }));
    }
}
