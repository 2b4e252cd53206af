//! Tool registry: native tools plus runtime-discovered providers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::tool::Tool;
use crate::agent::AgentInfo;
use crate::error::Result;
use crate::permission::{wildcard_match, Ruleset};
use crate::provider::ToolDefinition;

/// Source of tools discovered at runtime, such as MCP servers.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn tools(&self) -> Result<Vec<Arc<dyn Tool>>>;
}

/// Tools resolved for one model call, keyed by tool id.
pub type ResolvedTools = BTreeMap<String, Arc<dyn Tool>>;

/// Everything that narrows the tool set for a request.
#[derive(Debug, Clone, Copy)]
pub struct ToolScope<'a> {
    pub agent: &'a AgentInfo,
    /// Per-message enable map from the user message.
    pub user_tools: Option<&'a HashMap<String, bool>>,
    /// Merged agent and session ruleset.
    pub permission: &'a Ruleset,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    native: Arc<RwLock<Vec<Arc<dyn Tool>>>>,
    providers: Arc<RwLock<Vec<Arc<dyn ToolProvider>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native tool, replacing one with the same id.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let mut native = self.native.write().unwrap_or_else(|p| p.into_inner());
        native.retain(|existing| existing.id() != tool.id());
        native.push(tool);
    }

    pub fn register_provider(&self, provider: Arc<dyn ToolProvider>) {
        self.providers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(provider);
    }

    pub fn ids(&self) -> Vec<String> {
        self.native
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|tool| tool.id().to_string())
            .collect()
    }

    /// All tools, native first. A failing provider is logged and skipped.
    pub async fn all(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools = self.native.read().unwrap_or_else(|p| p.into_inner()).clone();
        let providers = self.providers.read().unwrap_or_else(|p| p.into_inner()).clone();
        for provider in providers {
            match provider.tools().await {
                Ok(found) => tools.extend(found),
                Err(err) => {
                    tracing::warn!(provider = provider.name(), error = %err, "tool provider failed to list tools")
                }
            }
        }
        tools
    }

    /// Tools available under `scope`: enabled for the agent and the user
    /// message, and not denied outright by the ruleset.
    pub async fn resolve(&self, scope: ToolScope<'_>) -> ResolvedTools {
        let mut resolved = ResolvedTools::new();
        for tool in self.all().await {
            let id = tool.id();
            if !scope.agent.tool_enabled(id)
                || !user_enabled(scope.user_tools, id)
                || scope.permission.disables(tool.permission())
            {
                continue;
            }
            resolved.entry(id.to_string()).or_insert(tool);
        }
        resolved
    }
}

fn user_enabled(tools: Option<&HashMap<String, bool>>, id: &str) -> bool {
    tools
        .and_then(|map| {
            map.iter()
                .filter(|(pattern, _)| wildcard_match(pattern, id))
                .max_by_key(|(pattern, _)| pattern.len())
                .map(|(_, enabled)| *enabled)
        })
        .unwrap_or(true)
}

/// Definitions sent to the model, in id order.
pub fn definitions(tools: &ResolvedTools) -> Vec<ToolDefinition> {
    tools
        .values()
        .map(|tool| ToolDefinition {
            name: tool.id().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters().schema.clone(),
        })
        .collect()
}
