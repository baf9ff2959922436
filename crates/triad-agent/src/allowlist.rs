//! Capability allowlist for tools requested by the remote agent

use std::collections::HashSet;
use triad_core::config::AgentConfig;

/// Exact tool names plus permitted name prefixes
#[derive(Debug, Clone, Default)]
pub struct ToolAllowlist {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl ToolAllowlist {
    pub fn new<I, P>(exact: I, prefixes: P) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            exact: exact.into_iter().map(Into::into).collect(),
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.allowed_tools.iter().cloned(),
            config.allowed_prefixes.iter().cloned(),
        )
    }

    /// Whether the remote agent may use `tool`
    pub fn is_allowed(&self, tool: &str) -> bool {
        if tool.is_empty() {
            return false;
        }
        self.exact.contains(tool) || self.prefixes.iter().any(|p| tool.starts_with(p.as_str()))
    }
}
