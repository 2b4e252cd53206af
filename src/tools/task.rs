//! Delegation tool: runs a subagent in a child session.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::arguments::ToolArguments;
use super::tool::{Tool, ToolContext};
use super::types::{ToolOutput, ToolParameters};
use crate::agent::AgentRegistry;
use crate::error::{Result, SessionError};
use crate::models::ModelRef;

pub const TASK_TOOL: &str = "task";

/// A delegated agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskRequest {
    pub parent_session_id: String,
    pub parent_message_id: String,
    pub agent: String,
    pub prompt: String,
    pub description: String,
    pub model: Option<ModelRef>,
    /// Resume an existing child session instead of creating one.
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskResult {
    pub session_id: String,
    pub text: String,
}

/// Runs a full generation for a subtask. Implemented by the agent loop.
#[async_trait]
pub trait SubtaskRunner: Send + Sync {
    async fn run_subtask(&self, request: SubtaskRequest, cancel: CancellationToken) -> Result<SubtaskResult>;
}

#[derive(serde::Deserialize)]
struct TaskArgs {
    description: String,
    prompt: String,
    subagent_type: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

pub struct TaskTool {
    agents: AgentRegistry,
    description: String,
    parameters: ToolParameters,
}

impl TaskTool {
    pub fn new(agents: AgentRegistry) -> Self {
        let listing = agents
            .subagents()
            .into_iter()
            .map(|agent| {
                format!(
                    "- {}: {}",
                    agent.name,
                    agent.description.unwrap_or_else(|| "This subagent should only be called manually by the user.".into())
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let description = format!(
            "Launch a new agent to handle complex, multi-step tasks autonomously.\n\n\
             Available agent types and the tools they have access to:\n{listing}\n\n\
             When using the Task tool, you must specify a subagent_type parameter to select which agent type to use."
        );
        let parameters = ToolParameters::object()
            .string("description", "A short (3-5 words) description of the task", true)
            .string("prompt", "The task for the agent to perform", true)
            .string("subagent_type", "The type of specialized agent to use for this task", true)
            .string("session_id", "Existing task session to continue", false)
            .build();
        Self {
            agents,
            description,
            parameters,
        }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn id(&self) -> &str {
        TASK_TOOL
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    fn permission_patterns(&self, args: &ToolArguments) -> Vec<String> {
        vec![args.get_str_opt("subagent_type").unwrap_or("*").to_string()]
    }

    async fn execute(&self, args: ToolArguments, ctx: ToolContext) -> Result<ToolOutput> {
        let args: TaskArgs = args.deserialize()?;
        let agent = self.agents.get(&args.subagent_type)?;
        if !agent.can_be_subagent() {
            return Err(SessionError::InvalidArgument(format!(
                "agent {} cannot be used as a subagent",
                agent.name
            )));
        }
        let runner = ctx
            .subtasks()
            .cloned()
            .ok_or_else(|| SessionError::InvalidState("no subtask runner available".into()))?;
        let model = args.model.as_deref().map(str::parse::<ModelRef>).transpose()?;

        let result = runner
            .run_subtask(
                SubtaskRequest {
                    parent_session_id: ctx.session_id.clone(),
                    parent_message_id: ctx.message_id.clone(),
                    agent: agent.name.clone(),
                    prompt: args.prompt,
                    description: args.description.clone(),
                    model,
                    session_id: args.session_id,
                },
                ctx.cancel.clone(),
            )
            .await?;

        let output = format!(
            "{}\n\n<task_metadata>\nsession_id: {}\n</task_metadata>",
            result.text, result.session_id
        );
        Ok(ToolOutput::text(args.description, output)
            .with_metadata("session_id", serde_json::Value::String(result.session_id)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<SubtaskRequest>>,
    }

    #[async_trait]
    impl SubtaskRunner for Recorder {
        async fn run_subtask(&self, request: SubtaskRequest, _cancel: CancellationToken) -> Result<SubtaskResult> {
            self.seen.lock().unwrap().push(request);
            Ok(SubtaskResult {
                session_id: "ses_child".into(),
                text: "found it".into(),
            })
        }
    }

    #[tokio::test]
    async fn delegates_to_runner_and_appends_metadata() {
        let runner = Arc::new(Recorder::default());
        let tool = TaskTool::new(AgentRegistry::with_defaults());
        assert!(tool.description().contains("- general:"));

        let ctx = ToolContext::new("ses_parent", "msg_1", "call_1", "build", CancellationToken::new())
            .with_subtasks(Some(runner.clone() as Arc<dyn SubtaskRunner>));
        let args = ToolArguments::new(json!({
            "description": "find things",
            "prompt": "look around",
            "subagent_type": "general",
        }));
        let output = tool.execute(args, ctx).await.unwrap();

        assert_eq!(output.title, "find things");
        assert_eq!(
            output.output,
            "found it\n\n<task_metadata>\nsession_id: ses_child\n</task_metadata>"
        );
        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].agent, "general");
        assert_eq!(seen[0].parent_session_id, "ses_parent");
    }

    #[tokio::test]
    async fn rejects_unknown_or_primary_agents() {
        let tool = TaskTool::new(AgentRegistry::with_defaults());
        let ctx = ToolContext::new("s", "m", "c", "build", CancellationToken::new());
        let unknown = ToolArguments::new(json!({"description": "d", "prompt": "p", "subagent_type": "nope"}));
        assert!(matches!(
            tool.execute(unknown, ctx.clone()).await,
            Err(SessionError::NotFound { .. })
        ));
        let primary = ToolArguments::new(json!({"description": "d", "prompt": "p", "subagent_type": "build"}));
        assert!(matches!(
            tool.execute(primary, ctx).await,
            Err(SessionError::InvalidArgument(_))
        ));
    }
}
