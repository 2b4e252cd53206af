//! Model references, limits and pricing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::types::Usage;

/// Reference to a model served by a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

impl FromStr for ModelRef {
    type Err = SessionError;

    /// Parse `"provider/model_id"` (or `"provider:model_id"`). The model id
    /// may itself contain slashes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let split = s.split_once('/').or_else(|| s.split_once(':'));
        match split {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Ok(Self::new(provider, model))
            }
            _ => Err(SessionError::InvalidArgument(format!(
                "Invalid model selector '{s}': expected 'provider/model_id'"
            ))),
        }
    }
}

/// Price per million tokens, in USD.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
}

impl ModelCost {
    /// Cost of `usage` in USD.
    pub fn cost_of(&self, usage: &Usage) -> f64 {
        let per = |tokens: u64, price: f64| (tokens as f64 / 1_000_000.0) * price;
        per(usage.input_tokens, self.input)
            + per(usage.output_tokens + usage.reasoning_tokens, self.output)
            + per(usage.cache_read_tokens, self.cache_read)
            + per(usage.cache_write_tokens, self.cache_write)
    }
}

/// Resolved model description: limits and pricing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub model: ModelRef,
    /// Context window in tokens. Zero means unknown.
    pub context_limit: u64,
    /// Maximum output tokens. Zero means unknown.
    pub output_limit: u64,
    #[serde(default)]
    pub cost: ModelCost,
    #[serde(default = "default_true")]
    pub supports_tools: bool,
}

fn default_true() -> bool {
    true
}

impl ModelInfo {
    pub fn new(model: ModelRef, context_limit: u64, output_limit: u64) -> Self {
        Self {
            model,
            context_limit,
            output_limit,
            cost: ModelCost::default(),
            supports_tools: true,
        }
    }

    pub fn with_cost(mut self, cost: ModelCost) -> Self {
        self.cost = cost;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_provider_and_model() {
        let model: ModelRef = "anthropic/claude-sonnet-4".parse().unwrap();
        assert_eq!(model, ModelRef::new("anthropic", "claude-sonnet-4"));
        assert_eq!(model.to_string(), "anthropic/claude-sonnet-4");
    }

    #[test]
    fn model_id_keeps_nested_slashes() {
        let model: ModelRef = "openrouter/meta/llama-3".parse().unwrap();
        assert_eq!(model.provider_id, "openrouter");
        assert_eq!(model.model_id, "meta/llama-3");
    }

    #[test]
    fn colon_separator_accepted() {
        let model: ModelRef = "openai:gpt-4o".parse().unwrap();
        assert_eq!(model, ModelRef::new("openai", "gpt-4o"));
    }

    #[test]
    fn parse_rejects_bare_ids() {
        assert!("gpt-4o".parse::<ModelRef>().is_err());
        assert!("/gpt".parse::<ModelRef>().is_err());
    }

    #[test]
    fn cost_scales_per_million() {
        let cost = ModelCost {
            input: 3.0,
            output: 15.0,
            cache_read: 0.3,
            cache_write: 3.75,
        };
        let usage = Usage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            reasoning_tokens: 0,
            cache_read_tokens: 1_000_000,
            cache_write_tokens: 0,
        };
        let total = cost.cost_of(&usage);
        assert!((total - 4.8).abs() < 1e-9);
    }
}
