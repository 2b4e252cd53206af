//! MCP integration: tools and resources from Model Context Protocol servers.
//!
//! Transports live outside this crate; a connected server is anything that
//! implements [`McpClient`].

pub mod bridge;
pub mod schema;

pub use bridge::{McpHub, McpTool};
pub use schema::{McpContent, McpResourceContent, McpToolResult, McpToolSchema};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A connected MCP server.
#[async_trait]
pub trait McpClient: Send + Sync {
    /// Server name as configured; used to namespace tool ids.
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<McpToolSchema>>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<McpToolResult>;

    async fn read_resource(&self, uri: &str) -> Result<Vec<McpResourceContent>>;
}
