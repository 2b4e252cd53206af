//! Plugin hooks: ordered, best-effort observers and mutators around the loop.
//!
//! A failing plugin is logged and skipped; it never aborts the generation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::MessageWithParts;
use crate::tools::ToolOutput;
use crate::types::{GenerationSettings, ModelMessage};

/// Identifies the tool invocation a hook fires for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolHookInput {
    pub tool: String,
    pub session_id: String,
    pub call_id: String,
}

/// Identifies the command a hook fires for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHookInput {
    pub command: String,
    pub session_id: String,
    pub arguments: String,
}

/// Context for the chat-parameters hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatParamsInput {
    pub session_id: String,
    pub agent: String,
    pub model: String,
}

/// A plugin. Every method defaults to a no-op.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn tool_execute_before(
        &self,
        _input: &ToolHookInput,
        _args: &mut serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }

    async fn tool_execute_after(&self, _input: &ToolHookInput, _output: &mut ToolOutput) -> Result<()> {
        Ok(())
    }

    async fn command_execute_before(&self, _input: &CommandHookInput) -> Result<()> {
        Ok(())
    }

    /// Fires once a user message and its parts are persisted.
    async fn chat_message(&self, _message: &MessageWithParts) -> Result<()> {
        Ok(())
    }

    /// Rewrites the outgoing model message list.
    async fn messages_transform(&self, _messages: &mut Vec<ModelMessage>) -> Result<()> {
        Ok(())
    }

    async fn chat_params(&self, _input: &ChatParamsInput, _settings: &mut GenerationSettings) -> Result<()> {
        Ok(())
    }
}

/// Runs plugins in registration order.
#[derive(Clone, Default)]
pub struct Hooks {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn tool_execute_before(&self, input: &ToolHookInput, args: &mut serde_json::Value) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.tool_execute_before(input, args).await {
                report(plugin.as_ref(), "tool.execute.before", &err);
            }
        }
    }

    pub async fn tool_execute_after(&self, input: &ToolHookInput, output: &mut ToolOutput) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.tool_execute_after(input, output).await {
                report(plugin.as_ref(), "tool.execute.after", &err);
            }
        }
    }

    pub async fn command_execute_before(&self, input: &CommandHookInput) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.command_execute_before(input).await {
                report(plugin.as_ref(), "command.execute.before", &err);
            }
        }
    }

    pub async fn chat_message(&self, message: &MessageWithParts) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.chat_message(message).await {
                report(plugin.as_ref(), "chat.message", &err);
            }
        }
    }

    pub async fn messages_transform(&self, messages: &mut Vec<ModelMessage>) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.messages_transform(messages).await {
                report(plugin.as_ref(), "messages.transform", &err);
            }
        }
    }

    pub async fn chat_params(&self, input: &ChatParamsInput, settings: &mut GenerationSettings) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.chat_params(input, settings).await {
                report(plugin.as_ref(), "chat.params", &err);
            }
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn report(plugin: &dyn Plugin, hook: &str, err: &crate::error::SessionError) {
    tracing::warn!(plugin = plugin.name(), hook, error = %err, "plugin hook failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use serde_json::json;

    struct Failing;

    #[async_trait]
    impl Plugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn tool_execute_before(
            &self,
            _input: &ToolHookInput,
            _args: &mut serde_json::Value,
        ) -> Result<()> {
            Err(SessionError::InvalidState("boom".into()))
        }
    }

    struct Tagger;

    #[async_trait]
    impl Plugin for Tagger {
        fn name(&self) -> &str {
            "tagger"
        }

        async fn tool_execute_before(
            &self,
            _input: &ToolHookInput,
            args: &mut serde_json::Value,
        ) -> Result<()> {
            args["tagged"] = json!(true);
            Ok(())
        }

        async fn tool_execute_after(&self, _input: &ToolHookInput, output: &mut ToolOutput) -> Result<()> {
            output.output.push_str(" (seen)");
            Ok(())
        }
    }

    fn input() -> ToolHookInput {
        ToolHookInput {
            tool: "echo".into(),
            session_id: "ses_1".into(),
            call_id: "call_1".into(),
        }
    }

    #[tokio::test]
    async fn failing_plugin_does_not_stop_later_plugins() {
        let hooks = Hooks::new()
            .with_plugin(Arc::new(Failing))
            .with_plugin(Arc::new(Tagger));
        let mut args = json!({"text": "hi"});
        hooks.tool_execute_before(&input(), &mut args).await;
        assert_eq!(args["tagged"], json!(true));

        let mut output = ToolOutput::text("echo", "hi");
        hooks.tool_execute_after(&input(), &mut output).await;
        assert_eq!(output.output, "hi (seen)");
    }
}
