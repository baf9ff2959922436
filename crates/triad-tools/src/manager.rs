//! Registry of running tool servers

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::{info, instrument, warn};
use triad_core::config::ToolsConfig;
use triad_core::{Result, ToolDispatcher, ToolInfo, TriadError};

use crate::protocol::ToolCallOutcome;
use crate::server::{ServerStatus, ToolServer};

/// Starts, routes to and stops the configured tool servers
pub struct ToolManager {
    servers: RwLock<Vec<Arc<ToolServer>>>,
}

impl ToolManager {
    /// Start every configured server in parallel
    ///
    /// Servers that fail to start are logged and left out. An error is
    /// returned only when servers were configured and none of them started.
    pub async fn start(config: &ToolsConfig) -> Result<Self> {
        let attempts = join_all(
            config
                .servers
                .iter()
                .map(|server| ToolServer::start(server, config)),
        )
        .await;

        let mut servers = Vec::new();
        let mut failures = Vec::new();
        for (server_config, attempt) in config.servers.iter().zip(attempts) {
            match attempt {
                Ok(server) => servers.push(Arc::new(server)),
                Err(e) => {
                    warn!(server = %server_config.name, "Tool server failed to start: {}", e);
                    failures.push(format!("{}: {}", server_config.name, e));
                }
            }
        }

        if servers.is_empty() && !failures.is_empty() {
            return Err(TriadError::Spawn {
                server: "*".to_string(),
                message: format!("no tool server started ({})", failures.join("; ")),
            });
        }

        info!(
            started = servers.len(),
            failed = failures.len(),
            "Tool servers started"
        );
        Ok(Self {
            servers: RwLock::new(servers),
        })
    }

    /// Manager with no servers
    pub fn empty() -> Self {
        Self {
            servers: RwLock::new(Vec::new()),
        }
    }

    fn snapshot(&self) -> Vec<Arc<ToolServer>> {
        match self.servers.read() {
            Ok(servers) => servers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Name of the first ready server advertising `tool`
    pub fn find_server(&self, tool: &str) -> Option<String> {
        self.snapshot()
            .iter()
            .find(|s| s.provides(tool))
            .map(|s| s.name().to_string())
    }

    /// Every tool advertised by a ready server, paired with the server name
    pub fn list_tools(&self) -> Vec<(String, ToolInfo)> {
        self.snapshot()
            .iter()
            .filter(|s| s.is_ready())
            .flat_map(|s| {
                s.tools()
                    .iter()
                    .map(|t| (s.name().to_string(), t.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        self.snapshot().iter().map(|s| s.status()).collect()
    }

    /// Call `tool` on the first ready server that advertises it
    #[instrument(skip(self, arguments))]
    pub async fn call(&self, tool: &str, arguments: Value) -> Result<ToolCallOutcome> {
        let server = self
            .snapshot()
            .into_iter()
            .find(|s| s.provides(tool))
            .ok_or_else(|| TriadError::ToolNotFound(tool.to_string()))?;
        server.call_tool(tool, arguments).await
    }

    /// Call `tool` on a named server
    #[instrument(skip(self, arguments))]
    pub async fn call_on(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolCallOutcome> {
        let target = self
            .snapshot()
            .into_iter()
            .find(|s| s.name() == server)
            .ok_or_else(|| TriadError::ServerNotFound(server.to_string()))?;
        target.call_tool(tool, arguments).await
    }

    /// Stop every server; safe to call more than once
    pub async fn shutdown(&self) {
        let servers = match self.servers.write() {
            Ok(mut servers) => std::mem::take(&mut *servers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if servers.is_empty() {
            return;
        }
        join_all(servers.iter().map(|s| s.shutdown())).await;
        info!(count = servers.len(), "Tool servers shut down");
    }
}

#[async_trait]
impl ToolDispatcher for ToolManager {
    async fn dispatch(&self, tool: &str, arguments: Value) -> Result<Value> {
        let outcome = self.call(tool, arguments).await?;
        if outcome.is_error {
            return Err(TriadError::ToolError {
                code: -1,
                message: outcome.text(),
            });
        }
        Ok(Value::String(outcome.text()))
    }
}
