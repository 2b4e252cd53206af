//! Agent Loop: drives one generation per session to a terminal state.
//!
//! Each iteration re-reads the session's history, classifies it with
//! [`LoopScan`] and does exactly one thing: run a queued subtask, process a
//! queued compaction, queue an automatic compaction, or take a normal model
//! step. The loop ends when the latest assistant message has answered the
//! latest user message.

pub mod processor;
pub mod state;

pub use processor::{StepOutcome, StepProcessor, StepRequest, StepResult};
pub use state::{LoopScan, LoopState, PendingTask};

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRegistry, DEFAULT_AGENT};
use crate::bus::Bus;
use crate::compaction::{CompactionEngine, CompactionOutcome};
use crate::config::LoopConfig;
use crate::controller::{Controller, Generation};
use crate::error::{MessageError, Result, SessionError};
use crate::hooks::{CommandHookInput, Hooks};
use crate::id::{self, Prefix};
use crate::mcp::McpHub;
use crate::message::{
    to_model_messages, AssistantMessage, MessageInfo, MessageWithParts, Part, SubtaskPart, TextPart, ToolPart,
    ToolState, UserMessage,
};
use crate::models::{ModelInfo, ModelRef};
use crate::permission::{PermissionGate, PermissionHandler, Ruleset};
use crate::prompt::{PartInput, PromptBuilder, PromptInput};
use crate::provider::ModelInvoker;
use crate::session::{title_from_text, Sessions};
use crate::storage::SharedStorage;
use crate::tools::{
    interrupt_unfinished, ResolvedTools, SubtaskRequest, SubtaskResult, SubtaskRunner, TaskTool, Tool,
    ToolExecutor, ToolInvocation, ToolRegistry, ToolRunOutcome, ToolScope, TruncationPolicy, TASK_TOOL,
};
use crate::types::{FinishReason, GenerationSettings, ModelMessage};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful coding assistant. Use the available tools to \
inspect and change the workspace, and answer concisely once the task is done.";

/// Appended as an assistant turn when the step budget is spent.
pub const MAX_STEPS_PROMPT: &str = "CRITICAL - MAXIMUM STEPS REACHED\n\n\
The maximum number of steps allowed for this task has been reached. Tools are disabled until the next user input. \
Respond with text only: summarize the work done so far and list any remaining tasks that were not completed.";

pub const SUBTASK_CONTINUE_PROMPT: &str = "Summarize the task tool output above and continue with your task.";

struct LoopInner {
    config: Arc<LoopConfig>,
    bus: Bus,
    sessions: Sessions,
    controller: Controller,
    gate: PermissionGate,
    agents: AgentRegistry,
    registry: ToolRegistry,
    task_tool: Arc<dyn Tool>,
    hooks: Hooks,
    prompts: PromptBuilder,
    executor: ToolExecutor,
    processor: StepProcessor,
    compaction: CompactionEngine,
}

/// The session agent loop and the services it owns.
#[derive(Clone)]
pub struct SessionLoop {
    inner: Arc<LoopInner>,
}

/// Subtask runner handed to the tool executor. Holds the loop weakly so the
/// executor does not keep its owner alive.
struct LoopHandle(Weak<LoopInner>);

#[async_trait]
impl SubtaskRunner for LoopHandle {
    async fn run_subtask(&self, request: SubtaskRequest, cancel: CancellationToken) -> Result<SubtaskResult> {
        let inner = self
            .0
            .upgrade()
            .ok_or_else(|| SessionError::InvalidState("session loop was dropped".into()))?;
        SessionLoop { inner }.run_subtask(request, cancel).await
    }
}

pub struct SessionLoopBuilder {
    storage: SharedStorage,
    invoker: Arc<dyn ModelInvoker>,
    config: LoopConfig,
    agents: Option<AgentRegistry>,
    hooks: Hooks,
    permission_handler: Option<PermissionHandler>,
    mcp: Option<McpHub>,
    tools: Vec<Arc<dyn Tool>>,
    default_model: Option<ModelRef>,
}

impl SessionLoopBuilder {
    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn agents(mut self, agents: AgentRegistry) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Without a handler every permission prompt is rejected.
    pub fn permission_handler(mut self, handler: PermissionHandler) -> Self {
        self.permission_handler = Some(handler);
        self
    }

    /// MCP servers supply tools and `mcp://` resources.
    pub fn mcp(mut self, hub: McpHub) -> Self {
        self.mcp = Some(hub);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn default_model(mut self, model: ModelRef) -> Self {
        self.default_model = Some(model);
        self
    }

    pub fn build(self) -> SessionLoop {
        let config = Arc::new(self.config);
        let bus = Bus::new(config.bus_capacity);
        let sessions = Sessions::new(self.storage, bus.clone());
        let controller = Controller::new(bus.clone());
        let agents = self.agents.unwrap_or_else(AgentRegistry::with_defaults);
        let hooks = self.hooks;

        let registry = ToolRegistry::new();
        for tool in self.tools {
            registry.register(tool);
        }
        let task_tool: Arc<dyn Tool> = Arc::new(TaskTool::new(agents.clone()));
        registry.register(task_tool.clone());

        let mut prompts = PromptBuilder::new(sessions.clone(), agents.clone(), hooks.clone())
            .with_truncation(TruncationPolicy::from_config(&config));
        if let Some(hub) = self.mcp {
            registry.register_provider(Arc::new(hub.clone()));
            prompts = prompts.with_mcp(hub);
        }
        if let Some(model) = self.default_model {
            prompts = prompts.with_default_model(model);
        }

        let gate = PermissionGate::new(controller.clone(), bus.clone(), self.permission_handler);
        let invoker = self.invoker;
        let inner = Arc::new_cyclic(|weak: &Weak<LoopInner>| {
            let executor = ToolExecutor::new(
                sessions.messages().clone(),
                gate.clone(),
                hooks.clone(),
                TruncationPolicy::from_config(&config),
            )
            .with_subtasks(Arc::new(LoopHandle(weak.clone())));
            let processor = StepProcessor::new(
                sessions.messages().clone(),
                invoker,
                executor.clone(),
                hooks.clone(),
                config.clone(),
            );
            let compaction = CompactionEngine::new(sessions.clone(), agents.clone(), processor.clone(), config.clone());
            LoopInner {
                config,
                bus,
                sessions,
                controller,
                gate,
                agents,
                registry,
                task_tool,
                hooks,
                prompts,
                executor,
                processor,
                compaction,
            }
        });
        SessionLoop { inner }
    }
}

impl SessionLoop {
    pub fn builder(storage: SharedStorage, invoker: Arc<dyn ModelInvoker>) -> SessionLoopBuilder {
        SessionLoopBuilder {
            storage,
            invoker,
            config: LoopConfig::default(),
            agents: None,
            hooks: Hooks::new(),
            permission_handler: None,
            mcp: None,
            tools: Vec::new(),
            default_model: None,
        }
    }

    pub fn sessions(&self) -> &Sessions {
        &self.inner.sessions
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    pub fn controller(&self) -> &Controller {
        &self.inner.controller
    }

    pub fn permissions(&self) -> &PermissionGate {
        &self.inner.gate
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.inner.agents
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.registry
    }

    pub fn compaction(&self) -> &CompactionEngine {
        &self.inner.compaction
    }

    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.inner.controller.is_busy(session_id)
    }

    /// Store the user message and run the session. While another generation
    /// is active this waits for it and returns its final assistant message.
    /// With `no_reply` the stored user message is returned instead.
    pub async fn prompt(&self, input: PromptInput) -> Result<MessageWithParts> {
        let session_id = input.session_id.clone();
        let no_reply = input.no_reply;
        let message = self.inner.prompts.build_user_message(input).await?;
        if no_reply {
            return Ok(message);
        }
        self.run(&session_id).await
    }

    /// Like [`prompt`](Self::prompt) but fails with [`SessionError::Busy`]
    /// instead of waiting. The session is claimed before anything is stored,
    /// so a busy session never receives the message.
    pub async fn try_prompt(&self, input: PromptInput) -> Result<MessageWithParts> {
        let generation = self.claim(&input.session_id)?;
        let no_reply = input.no_reply;
        let message = match self.inner.prompts.build_user_message(input).await {
            Ok(message) => message,
            Err(err) => return Err(self.abandon(&generation, err)),
        };
        if no_reply && (generation.is_cancelled() || self.inner.controller.release(&generation)) {
            return Ok(message);
        }
        self.execute(generation).await
    }

    /// Ask for a summary of the session now. Fails when a generation is active.
    pub async fn summarize(&self, session_id: &str, model: ModelRef) -> Result<MessageWithParts> {
        let generation = self.claim(session_id)?;
        let queued = async {
            let history = self.inner.sessions.messages().list(session_id).await?;
            let agent = history
                .iter()
                .rev()
                .find_map(|message| message.info.as_user().map(|user| user.agent.clone()))
                .unwrap_or_else(|| DEFAULT_AGENT.to_string());
            self.inner.compaction.create(session_id, &agent, model, false).await
        };
        if let Err(err) = queued.await {
            return Err(self.abandon(&generation, err));
        }
        self.execute(generation).await
    }

    /// Delete a session and its children, aborting their generations and
    /// dropping the permission state kept for them.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        for id in self.inner.sessions.delete(session_id).await? {
            self.inner.controller.forget(&id);
            self.inner.gate.forget(&id).await;
        }
        Ok(())
    }

    /// Abort the session's generation. A no-op when idle.
    pub fn cancel(&self, session_id: &str) {
        self.inner.controller.cancel(session_id);
    }

    /// Abort every generation and reject all waiters.
    pub fn shutdown(&self) {
        self.inner.controller.shutdown();
    }

    /// Run the session until the latest user message is answered, or join
    /// the generation already doing so.
    pub async fn run(&self, session_id: &str) -> Result<MessageWithParts> {
        let generation = loop {
            if let Some(generation) = self.inner.controller.start(session_id) {
                break generation;
            }
            if let Some(waiter) = self.inner.controller.wait(session_id) {
                tracing::debug!(session_id, "session busy; waiting for active generation");
                return match waiter.await {
                    Ok(Ok(message)) => Ok(message),
                    Ok(Err(error)) => Err(from_message_error(error)),
                    Err(_) => Err(SessionError::Aborted),
                };
            }
            // Finished between `start` and `wait`; try again.
        };
        self.execute(generation).await
    }

    fn claim(&self, session_id: &str) -> Result<Generation> {
        self.inner.controller.start(session_id).ok_or_else(|| SessionError::Busy {
            session_id: session_id.to_string(),
        })
    }

    /// Fail a claimed generation before it ran, passing `err` to any waiters.
    fn abandon(&self, generation: &Generation, err: SessionError) -> SessionError {
        self.inner.controller.finish(generation, Err(err.to_message_error()));
        err
    }

    async fn execute(&self, generation: Generation) -> Result<MessageWithParts> {
        let result = self.drive(&generation).await;
        let delivered = match &result {
            Ok(message) => Ok(message.clone()),
            Err(err) => Err(err.to_message_error()),
        };
        self.inner.controller.finish(&generation, delivered);
        result
    }

    async fn drive(&self, generation: &Generation) -> Result<MessageWithParts> {
        let session_id = generation.session_id();
        let mut created = Vec::new();
        let outcome = self.iterate(session_id, generation.token(), &mut created).await;

        // Only this generation's assistants are touched: after a cancel the
        // session may already belong to a newer generation.
        let messages = self.inner.sessions.messages();
        let aborted = matches!(outcome, Err(SessionError::Aborted));
        for message_id in &created {
            let message = messages.get(session_id, message_id).await?;
            interrupt_unfinished(messages, &message).await?;
            if let (true, MessageInfo::Assistant(assistant)) = (aborted, &message.info) {
                if assistant.time.completed.is_none() {
                    let mut assistant = assistant.clone();
                    assistant.complete();
                    messages.update_message(&MessageInfo::Assistant(assistant)).await?;
                }
            }
        }
        if let Err(err) = outcome {
            tracing::debug!(session_id, error = %err, "generation ended early");
            return Err(err);
        }

        if let Err(err) = self.inner.compaction.prune(session_id).await {
            tracing::warn!(session_id, error = %err, "pruning failed");
        }
        match created.last() {
            Some(message_id) => messages.get(session_id, message_id).await,
            None => self.latest_assistant(session_id).await?.ok_or_else(|| {
                SessionError::InvalidState(format!("session {session_id} has no assistant message"))
            }),
        }
    }

    /// Drive the state machine until the turn ends. Every assistant message
    /// written on the way is recorded in `created`.
    async fn iterate(&self, session_id: &str, cancel: &CancellationToken, created: &mut Vec<String>) -> Result<()> {
        let inner = &self.inner;
        let mut step = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(SessionError::Aborted);
            }
            let history = inner.sessions.messages().filtered(session_id).await?;
            let scan = LoopScan::scan(&history);
            let Some(user) = scan.last_user.clone() else {
                return Err(SessionError::InvalidState(format!("session {session_id} has no user message")));
            };
            let model = inner.processor.invoker().model(&user.model).await?;
            let state = scan.state(|finished| inner.compaction.is_overflow(&finished.tokens, &model));
            tracing::debug!(session_id, step, ?state, "loop iteration");

            match state {
                LoopState::Done => return Ok(()),
                LoopState::SubtaskPending => {
                    if let Some(PendingTask::Subtask(subtask)) = scan.next_task() {
                        self.run_queued_subtask(&user, subtask, cancel, created).await?;
                    }
                }
                LoopState::CompactionPending => {
                    let Some(task) = scan.next_task() else {
                        continue;
                    };
                    let outcome = inner
                        .compaction
                        .process(&history, task.message_id(), session_id, cancel, created)
                        .await?;
                    if outcome == CompactionOutcome::Stop {
                        return Ok(());
                    }
                }
                LoopState::OverflowDetected => {
                    inner
                        .compaction
                        .create(session_id, &user.agent, user.model.clone(), true)
                        .await?;
                }
                LoopState::Normal => {
                    step += 1;
                    let outcome = self.step(&user, &model, &history, step, cancel, created).await?;
                    if step == 1 {
                        self.ensure_title(session_id).await?;
                    }
                    match outcome {
                        StepOutcome::Stop => return Ok(()),
                        StepOutcome::Compact => {
                            inner
                                .compaction
                                .create(session_id, &user.agent, user.model.clone(), true)
                                .await?;
                        }
                        StepOutcome::Continue => {}
                    }
                }
            }
        }
    }

    /// One model call answering `user`.
    async fn step(
        &self,
        user: &UserMessage,
        model: &ModelInfo,
        history: &[MessageWithParts],
        step: usize,
        cancel: &CancellationToken,
        created: &mut Vec<String>,
    ) -> Result<StepOutcome> {
        let inner = &self.inner;
        let agent = inner.agents.get(&user.agent)?;
        let session = inner.sessions.get(&user.session_id).await?;
        let ruleset = Ruleset::merge(&[&agent.permission, &session.permission]);

        let last_step = agent
            .max_steps
            .or(inner.config.max_steps)
            .is_some_and(|max| step >= max);
        let tools = if last_step || !model.supports_tools {
            ResolvedTools::new()
        } else {
            inner
                .registry
                .resolve(ToolScope {
                    agent: &agent,
                    user_tools: user.tools.as_ref(),
                    permission: &ruleset,
                })
                .await
        };

        let mut messages = to_model_messages(history);
        if last_step {
            tracing::debug!(session_id = %user.session_id, step, "step budget reached; tools disabled");
            messages.push(ModelMessage::assistant(MAX_STEPS_PROMPT));
        }
        let mut system = vec![agent.prompt.clone().unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())];
        system.extend(user.system.clone());
        let settings = GenerationSettings {
            temperature: agent.temperature,
            top_p: agent.top_p,
            ..GenerationSettings::default()
        };

        let assistant = AssistantMessage::new(user, &agent.name, user.model.clone());
        inner
            .sessions
            .messages()
            .update_message(&MessageInfo::Assistant(assistant.clone()))
            .await?;
        created.push(assistant.id.clone());

        let result = inner
            .processor
            .process(StepRequest {
                assistant,
                model: model.clone(),
                system,
                messages,
                tools,
                settings,
                ruleset,
                cancel: cancel.clone(),
            })
            .await?;
        Ok(result.outcome)
    }

    /// Run a user-queued subtask as a single task-tool call on a new
    /// assistant message, then ask the model to carry on.
    async fn run_queued_subtask(
        &self,
        user: &UserMessage,
        subtask: &SubtaskPart,
        cancel: &CancellationToken,
        created: &mut Vec<String>,
    ) -> Result<()> {
        let inner = &self.inner;
        let messages = inner.sessions.messages();
        let session_id = user.session_id.as_str();

        let model = subtask.model.clone().unwrap_or_else(|| user.model.clone());
        let mut assistant = AssistantMessage::new(user, &subtask.agent, model);
        messages.update_message(&MessageInfo::Assistant(assistant.clone())).await?;
        created.push(assistant.id.clone());

        if let Some(command) = &subtask.command {
            inner
                .hooks
                .command_execute_before(&CommandHookInput {
                    command: command.clone(),
                    session_id: session_id.to_string(),
                    arguments: subtask.prompt.clone(),
                })
                .await;
        }

        let mut input = json!({
            "description": subtask.description,
            "prompt": subtask.prompt,
            "subagent_type": subtask.agent,
        });
        if let Some(model) = &subtask.model {
            input["model"] = json!(model.to_string());
        }
        let mut part = ToolPart::pending(session_id, &assistant.id, id::ascending(Prefix::Call), TASK_TOOL);
        part.state = ToolState::Pending {
            input,
            raw: String::new(),
        };
        messages.update_part(&Part::Tool(part.clone())).await?;

        let (_, outcome) = inner
            .executor
            .execute(ToolInvocation {
                tool: inner.task_tool.clone(),
                part,
                agent: subtask.agent.clone(),
                ruleset: Ruleset::default(),
                cancel: cancel.clone(),
                skip_permission: true,
            })
            .await?;
        if outcome == ToolRunOutcome::Interrupted || cancel.is_cancelled() {
            return Err(SessionError::Aborted);
        }

        assistant.finish = Some(FinishReason::ToolCalls);
        assistant.complete();
        messages.update_message(&MessageInfo::Assistant(assistant)).await?;

        let info = UserMessage::new(session_id, &user.agent, user.model.clone());
        let text = Part::Text(TextPart::synthetic(session_id, &info.id, SUBTASK_CONTINUE_PROMPT));
        messages.update_message(&MessageInfo::User(info)).await?;
        messages.update_part(&text).await?;
        tracing::debug!(session_id, agent = %subtask.agent, ?outcome, "queued subtask finished");
        Ok(())
    }

    async fn ensure_title(&self, session_id: &str) -> Result<()> {
        let sessions = &self.inner.sessions;
        let session = sessions.get(session_id).await?;
        if session.parent_id.is_some() || !session.has_default_title() {
            return Ok(());
        }
        if let Some(title) = sessions
            .first_user_text(session_id)
            .await?
            .as_deref()
            .and_then(title_from_text)
        {
            sessions.set_title(session_id, title).await?;
        }
        Ok(())
    }

    async fn latest_assistant(&self, session_id: &str) -> Result<Option<MessageWithParts>> {
        let history = self.inner.sessions.messages().list(session_id).await?;
        Ok(history
            .into_iter()
            .rev()
            .find(|message| matches!(message.info, MessageInfo::Assistant(_))))
    }
}

#[async_trait]
impl SubtaskRunner for SessionLoop {
    /// Run `request` in a child session (new, or resumed by id) and return
    /// the child's final text.
    async fn run_subtask(&self, request: SubtaskRequest, cancel: CancellationToken) -> Result<SubtaskResult> {
        let sessions = &self.inner.sessions;
        let agent = self.inner.agents.get(&request.agent)?;
        let child = match &request.session_id {
            Some(id) => sessions.get(id).await?,
            None => {
                let parent = sessions.get(&request.parent_session_id).await?;
                sessions
                    .create(
                        Some(parent.id.clone()),
                        Some(format!("{} (@{} subagent)", request.description, agent.name)),
                        parent.directory,
                    )
                    .await?
            }
        };

        let model = match request.model.clone().or_else(|| agent.model.clone()) {
            Some(model) => model,
            None => self.parent_model(&request).await?,
        };
        let input = PromptInput::builder()
            .session_id(child.id.clone())
            .model(model)
            .agent(agent.name.clone())
            .parts(vec![PartInput::text(request.prompt.clone())])
            .build();

        if cancel.is_cancelled() {
            return Err(SessionError::Aborted);
        }
        let watcher = {
            let this = self.clone();
            let cancel = cancel.clone();
            let child_id = child.id.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                this.cancel(&child_id);
            })
        };
        let result = self.prompt(input).await;
        watcher.abort();
        let message = result?;

        if let Some(error) = message.info.as_assistant().and_then(|assistant| assistant.error.clone()) {
            return Err(SessionError::Model(error));
        }
        tracing::debug!(
            parent_session_id = %request.parent_session_id,
            session_id = %child.id,
            agent = %agent.name,
            "subtask finished"
        );
        Ok(SubtaskResult {
            session_id: child.id,
            text: message.text(),
        })
    }
}

impl SessionLoop {
    /// Model of the message that issued the task call.
    async fn parent_model(&self, request: &SubtaskRequest) -> Result<ModelRef> {
        let info = self
            .inner
            .sessions
            .messages()
            .info(&request.parent_session_id, &request.parent_message_id)
            .await?
            .ok_or_else(|| SessionError::not_found("message", request.parent_message_id.clone()))?;
        Ok(match info {
            MessageInfo::Assistant(assistant) => assistant.model,
            MessageInfo::User(user) => user.model,
        })
    }
}

fn from_message_error(error: MessageError) -> SessionError {
    if error.is_aborted() {
        SessionError::Aborted
    } else {
        SessionError::Model(error)
    }
}
