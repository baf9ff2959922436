//! Seam between the agent transport and whatever executes tools

use async_trait::async_trait;

use crate::Result;

/// Executes a named tool with JSON arguments
///
/// Implemented by the tool process manager; consumed by the agent transport
/// when it is configured to forward allowed tool requests.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, tool: &str, arguments: serde_json::Value) -> Result<serde_json::Value>;
}
