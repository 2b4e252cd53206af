//! Tool trait, execution context and closure-based tool wrapper.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::arguments::ToolArguments;
use super::task::SubtaskRunner;
use super::types::{ToolOutput, ToolParameters};
use crate::error::Result;
use crate::message::Extensions;

/// Pushes a title/metadata update onto the running tool part.
pub type MetadataSink = Arc<dyn Fn(Option<String>, Extensions) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Context available during tool execution.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub message_id: String,
    pub call_id: String,
    pub agent: String,
    pub cancel: CancellationToken,
    metadata: Option<MetadataSink>,
    subtasks: Option<Arc<dyn SubtaskRunner>>,
}

impl ToolContext {
    pub fn new(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        call_id: impl Into<String>,
        agent: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            call_id: call_id.into(),
            agent: agent.into(),
            cancel,
            metadata: None,
            subtasks: None,
        }
    }

    pub fn with_metadata_sink(mut self, sink: MetadataSink) -> Self {
        self.metadata = Some(sink);
        self
    }

    pub fn with_subtasks(mut self, runner: Option<Arc<dyn SubtaskRunner>>) -> Self {
        self.subtasks = runner;
        self
    }

    pub fn subtasks(&self) -> Option<&Arc<dyn SubtaskRunner>> {
        self.subtasks.as_ref()
    }

    /// Update the running part's title and metadata. A no-op without a sink.
    pub async fn set_metadata(&self, title: Option<String>, metadata: Extensions) -> Result<()> {
        match &self.metadata {
            Some(sink) => sink(title, metadata).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("session_id", &self.session_id)
            .field("message_id", &self.message_id)
            .field("call_id", &self.call_id)
            .field("agent", &self.agent)
            .finish()
    }
}

/// Core tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool id; must match what the model calls.
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> &ToolParameters;

    /// Permission key checked against rulesets.
    fn permission(&self) -> &str {
        self.id()
    }

    /// Patterns the permission check is evaluated against for this call.
    fn permission_patterns(&self, _args: &ToolArguments) -> Vec<String> {
        vec!["*".to_string()]
    }

    /// Whether an "always" reply may be remembered for this tool.
    fn allow_always(&self) -> bool {
        true
    }

    async fn execute(&self, args: ToolArguments, ctx: ToolContext) -> Result<ToolOutput>;
}

type ToolHandler = dyn Fn(ToolArguments, ToolContext) -> BoxFuture<'static, Result<ToolOutput>> + Send + Sync;

/// Closure-based tool for ad hoc tools.
pub struct FunctionTool {
    id: String,
    description: String,
    parameters: ToolParameters,
    permission: Option<String>,
    handler: Arc<ToolHandler>,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        id: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        Self {
            id: id.into(),
            description: description.into(),
            parameters,
            permission: None,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }

    /// Check permissions under a different key than the tool id.
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    fn permission(&self) -> &str {
        self.permission.as_deref().unwrap_or(&self.id)
    }

    async fn execute(&self, args: ToolArguments, ctx: ToolContext) -> Result<ToolOutput> {
        (self.handler)(args, ctx).await
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("id", &self.id)
            .field("description", &self.description)
            .finish()
    }
}
