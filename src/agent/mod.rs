//! Agent definitions: prompt, model, step budget, tools and permissions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Result, SessionError};
use crate::models::ModelRef;
use crate::permission::{wildcard_match, PermissionAction, Ruleset};

pub const DEFAULT_AGENT: &str = "build";
pub const GENERAL_AGENT: &str = "general";
pub const COMPACTION_AGENT: &str = "compaction";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentMode {
    Primary,
    Subagent,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInfo {
    pub name: String,
    pub mode: AgentMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Model override. Falls back to the triggering message's model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Step budget. Falls back to the loop configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Tool enablement; keys may be wildcards. Unlisted tools are enabled.
    #[serde(default)]
    pub tools: HashMap<String, bool>,
    #[serde(default)]
    pub permission: Ruleset,
    #[serde(default)]
    pub hidden: bool,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>, mode: AgentMode) -> Self {
        Self {
            name: name.into(),
            mode,
            description: None,
            model: None,
            prompt: None,
            max_steps: None,
            temperature: None,
            top_p: None,
            tools: HashMap::new(),
            permission: Ruleset::default(),
            hidden: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, model: ModelRef) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_steps = Some(steps);
        self
    }

    pub fn with_tool(mut self, pattern: impl Into<String>, enabled: bool) -> Self {
        self.tools.insert(pattern.into(), enabled);
        self
    }

    pub fn with_permission(mut self, permission: Ruleset) -> Self {
        self.permission = permission;
        self
    }

    pub fn can_be_subagent(&self) -> bool {
        matches!(self.mode, AgentMode::Subagent | AgentMode::All)
    }

    /// Whether `tool_id` is enabled, letting the most specific key decide.
    pub fn tool_enabled(&self, tool_id: &str) -> bool {
        self.tools
            .iter()
            .filter(|(pattern, _)| wildcard_match(pattern, tool_id))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, enabled)| *enabled)
            .unwrap_or(true)
    }
}

/// Registry of named agents.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentInfo>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `build` (primary), `general` (subagent) and the hidden `compaction` agent.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(
            AgentInfo::new(DEFAULT_AGENT, AgentMode::Primary)
                .with_description("Default agent. Executes tools as permissions allow."),
        );
        registry.register(
            AgentInfo::new(GENERAL_AGENT, AgentMode::Subagent)
                .with_description("General-purpose agent for multi-step research and delegated work.")
                .with_tool("task", false),
        );
        let mut compaction = AgentInfo::new(COMPACTION_AGENT, AgentMode::Primary)
            .with_prompt(COMPACTION_PROMPT)
            .with_tool("*", false)
            .with_permission(Ruleset::default().with("*", "*", PermissionAction::Deny));
        compaction.hidden = true;
        registry.register(compaction);
        registry
    }

    pub fn register(&self, agent: AgentInfo) {
        if let Ok(mut agents) = self.agents.write() {
            agents.insert(agent.name.clone(), agent);
        }
    }

    pub fn get(&self, name: &str) -> Result<AgentInfo> {
        self.agents
            .read()
            .ok()
            .and_then(|agents| agents.get(name).cloned())
            .ok_or_else(|| SessionError::not_found("agent", name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents
            .read()
            .map(|agents| agents.contains_key(name))
            .unwrap_or(false)
    }

    /// Agents that can be delegated to, sorted by name.
    pub fn subagents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .agents
            .read()
            .map(|agents| {
                agents
                    .values()
                    .filter(|agent| agent.can_be_subagent() && !agent.hidden)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }
}

pub const COMPACTION_PROMPT: &str = "You are a helpful AI assistant tasked with summarizing conversations. \
When asked to summarize, provide a detailed but concise summary of the conversation. \
Focus on information that would be helpful for continuing the conversation, including: \
what was done, what is currently being worked on, which files are being modified, \
and what needs to be done next.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_registered() {
        let registry = AgentRegistry::with_defaults();
        assert!(registry.contains(DEFAULT_AGENT));
        assert!(registry.get(COMPACTION_AGENT).unwrap().hidden);
        let names: Vec<String> = registry.subagents().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec![GENERAL_AGENT.to_string()]);
        assert!(matches!(
            registry.get("missing"),
            Err(SessionError::NotFound { kind: "agent", .. })
        ));
    }

    #[test]
    fn most_specific_tool_key_wins() {
        let agent = AgentInfo::new("plan", AgentMode::Primary)
            .with_tool("*", false)
            .with_tool("read", true);
        assert!(agent.tool_enabled("read"));
        assert!(!agent.tool_enabled("bash"));
        assert!(AgentInfo::new("x", AgentMode::All).tool_enabled("bash"));
    }
}
