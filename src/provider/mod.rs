//! Model Invocation collaborator.
//!
//! The loop never talks to a vendor SDK directly. It hands a fully prepared
//! [`ProviderRequest`] to a [`ModelInvoker`] and consumes the normalized
//! [`ModelStream`]. Vendor quirks and transport live behind this trait.

pub mod scripted;

pub use scripted::{ScriptedModel, ScriptedTurn};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{MessageError, Result};
use crate::models::{ModelInfo, ModelRef};
use crate::types::{GenerationSettings, ModelMessage, ModelStream};

/// One model call as prepared by the loop.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub session_id: String,
    pub model: ModelInfo,
    pub system: Vec<String>,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolDefinition>,
    pub settings: GenerationSettings,
}

impl ProviderRequest {
    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }
}

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Resolve limits and pricing for a model reference.
    async fn model(&self, model: &ModelRef) -> Result<ModelInfo>;

    /// Start a streaming call. Implementations must stop producing events
    /// promptly once `cancel` fires.
    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<ModelStream, MessageError>;
}
