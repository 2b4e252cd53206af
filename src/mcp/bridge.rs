//! Bridge MCP servers into the tool registry and the prompt builder.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::schema::{McpContent, McpResourceContent, McpToolResult, McpToolSchema};
use super::McpClient;
use crate::error::{Result, SessionError};
use crate::message::{FilePart, PartBase};
use crate::tools::{Tool, ToolArguments, ToolContext, ToolOutput, ToolParameters, ToolProvider};

/// An MCP tool exposed through the [`Tool`] trait.
///
/// Replies of `always` are never remembered for MCP tools.
pub struct McpTool {
    client: Arc<dyn McpClient>,
    id: String,
    remote_name: String,
    description: String,
    parameters: ToolParameters,
}

impl McpTool {
    pub fn new(client: Arc<dyn McpClient>, schema: McpToolSchema) -> Self {
        Self {
            id: tool_id(client.name(), &schema.name),
            client,
            remote_name: schema.name,
            description: schema.description.unwrap_or_default(),
            parameters: ToolParameters::from_schema(schema.input_schema),
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    fn allow_always(&self) -> bool {
        false
    }

    async fn execute(&self, args: ToolArguments, ctx: ToolContext) -> Result<ToolOutput> {
        let result = self
            .client
            .call_tool(&self.remote_name, args.into_value(), ctx.cancel.clone())
            .await?;
        let output = flatten_result(&ctx, result.clone());
        if result.is_error {
            return Err(SessionError::tool(&self.id, output.output));
        }
        Ok(ToolOutput {
            title: self.remote_name.clone(),
            ..output
        })
    }
}

/// Text items joined by blank lines; images and blobs become attachments.
fn flatten_result(ctx: &ToolContext, result: McpToolResult) -> ToolOutput {
    let mut texts = Vec::new();
    let mut attachments = Vec::new();
    for item in result.content {
        match item {
            McpContent::Text { text } => texts.push(text),
            McpContent::Image { data, mime_type } => {
                attachments.push(attachment(ctx, format!("data:{mime_type};base64,{data}"), mime_type, None))
            }
            McpContent::Resource { resource } => match resource {
                McpResourceContent::Text { text, .. } => texts.push(text),
                McpResourceContent::Blob { uri, mime_type, blob } => {
                    let mime = mime_type.unwrap_or_else(|| "application/octet-stream".into());
                    attachments.push(attachment(ctx, format!("data:{mime};base64,{blob}"), mime, Some(uri)))
                }
            },
        }
    }
    ToolOutput {
        output: texts.join("\n\n"),
        attachments,
        ..ToolOutput::default()
    }
}

fn attachment(ctx: &ToolContext, url: String, mime: String, filename: Option<String>) -> FilePart {
    FilePart {
        base: PartBase::new(&ctx.session_id, &ctx.message_id),
        mime,
        filename,
        url,
        source: None,
    }
}

/// `{client}_{tool}` with anything outside `[A-Za-z0-9_-]` replaced.
pub fn tool_id(client: &str, tool: &str) -> String {
    format!("{client}_{tool}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// The set of connected MCP servers.
#[derive(Clone, Default)]
pub struct McpHub {
    clients: Arc<RwLock<Vec<Arc<dyn McpClient>>>>,
}

impl McpHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, client: Arc<dyn McpClient>) {
        self.clients
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(client);
    }

    fn clients(&self) -> Vec<Arc<dyn McpClient>> {
        self.clients.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn client(&self, name: &str) -> Result<Arc<dyn McpClient>> {
        self.clients()
            .into_iter()
            .find(|client| client.name() == name)
            .ok_or_else(|| SessionError::not_found("mcp client", name))
    }

    pub async fn read_resource(&self, client_name: &str, uri: &str) -> Result<Vec<McpResourceContent>> {
        self.client(client_name)?.read_resource(uri).await
    }
}

#[async_trait]
impl ToolProvider for McpHub {
    fn name(&self) -> &str {
        "mcp"
    }

    async fn tools(&self) -> Result<Vec<Arc<dyn Tool>>> {
        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
        for client in self.clients() {
            match client.list_tools().await {
                Ok(schemas) => tools.extend(
                    schemas
                        .into_iter()
                        .map(|schema| Arc::new(McpTool::new(client.clone(), schema)) as Arc<dyn Tool>),
                ),
                Err(err) => tracing::warn!(client = client.name(), error = %err, "mcp list_tools failed"),
            }
        }
        Ok(tools)
    }
}
