//! Shared test helpers: a scripted model and a ready-to-use session loop.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Notify;

use roci_session::agent_loop::{SessionLoop, SessionLoopBuilder};
use roci_session::config::LoopConfig;
use roci_session::error::SessionError;
use roci_session::message::{MessageWithParts, ToolPart};
use roci_session::models::{ModelInfo, ModelRef};
use roci_session::permission::{PermissionHandler, PermissionReply};
use roci_session::prompt::{PartInput, PromptInput};
use roci_session::provider::ScriptedModel;
use roci_session::storage::{MemoryStorage, SharedStorage};
use roci_session::tools::{FunctionTool, Tool, ToolOutput, ToolParameters};

pub const CONTEXT_LIMIT: u64 = 10_000;
pub const OUTPUT_LIMIT: u64 = 1_000;

pub fn model_info() -> ModelInfo {
    ModelInfo::new(ModelRef::new("test", "scripted"), CONTEXT_LIMIT, OUTPUT_LIMIT)
}

/// A session loop over in-memory storage and a scripted model.
pub struct Harness {
    pub session_loop: SessionLoop,
    pub model: ScriptedModel,
    pub asks: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(LoopConfig::default(), |builder| builder)
    }

    /// Build with `config`, letting `customize` add tools or handlers. The
    /// default permission handler approves every prompt once.
    pub fn with<F>(config: LoopConfig, customize: F) -> Self
    where
        F: FnOnce(SessionLoopBuilder) -> SessionLoopBuilder,
    {
        Self::with_storage(Arc::new(MemoryStorage::new()), config, customize)
    }

    pub fn with_storage<F>(storage: SharedStorage, config: LoopConfig, customize: F) -> Self
    where
        F: FnOnce(SessionLoopBuilder) -> SessionLoopBuilder,
    {
        let model = ScriptedModel::new().with_model(model_info());
        let asks = Arc::new(AtomicUsize::new(0));
        let builder = SessionLoop::builder(storage, Arc::new(model.clone()))
            .config(config)
            .permission_handler(approve_once(asks.clone()))
            .tool(echo_tool());
        Self {
            session_loop: customize(builder).build(),
            model,
            asks,
        }
    }

    pub async fn session(&self) -> String {
        self.session_loop
            .sessions()
            .create(None, None, ".")
            .await
            .expect("create session")
            .id
    }

    pub fn input(&self, session_id: &str, text: &str) -> PromptInput {
        PromptInput::builder()
            .session_id(session_id)
            .model(model_info().model)
            .parts(vec![PartInput::text(text)])
            .build()
    }

    pub async fn history(&self, session_id: &str) -> Vec<MessageWithParts> {
        self.session_loop
            .sessions()
            .messages()
            .list(session_id)
            .await
            .expect("list messages")
    }

    pub async fn tool_parts(&self, session_id: &str) -> Vec<ToolPart> {
        self.history(session_id)
            .await
            .iter()
            .flat_map(|message| message.tool_parts().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Poll until a tool part of `session_id` is running.
    pub async fn wait_for_running_tool(&self, session_id: &str) {
        for _ in 0..200 {
            let running = self
                .tool_parts(session_id)
                .await
                .iter()
                .any(|part| part.state.status() == roci_session::message::ToolStatus::Running);
            if running {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("no tool started running");
    }

    pub async fn wait_until_busy(&self, session_id: &str) {
        for _ in 0..200 {
            if self.session_loop.is_busy(session_id) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("session never became busy");
    }
}

pub fn approve_once(asks: Arc<AtomicUsize>) -> PermissionHandler {
    Arc::new(move |_request| {
        asks.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(PermissionReply::Once) })
    })
}

pub fn reply_with(reply: PermissionReply) -> PermissionHandler {
    Arc::new(move |_request| Box::pin(async move { Ok(reply) }))
}

/// `echo` returns its `text` argument.
pub fn echo_tool() -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(
        "echo",
        "Echo the input text",
        ToolParameters::object().string("text", "Text to echo", true).build(),
        |args, _ctx| async move {
            let text = args.get_str("text")?.to_string();
            Ok(ToolOutput::text("echo", text))
        },
    ))
}

/// `wait` blocks until `release` is notified.
pub fn gated_tool(release: Arc<Notify>) -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(
        "wait",
        "Wait for a signal",
        ToolParameters::empty(),
        move |_args, _ctx| {
            let release = release.clone();
            async move {
                release.notified().await;
                Ok(ToolOutput::text("wait", "released"))
            }
        },
    ))
}

/// `hang` never finishes on its own.
pub fn hanging_tool() -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(
        "hang",
        "Never returns",
        ToolParameters::empty(),
        |_args, ctx| async move {
            ctx.cancel.cancelled().await;
            Err(SessionError::Aborted)
        },
    ))
}

pub fn no_args() -> serde_json::Value {
    json!({})
}
