//! Seams between the orchestrator and the agents playing each role

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use triad_core::{ExecutionResult, Result, TodoItem, TodoList, ToolInfo, VerificationResult};
use triad_verify::VerificationGate;

use crate::decision::PlanningDecision;
use crate::session::Turn;

/// One tool invocation chosen for an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedToolCall {
    pub tool: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub arguments: Value,
}

/// How a request is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Answered directly, no tools run
    Chat,
    /// Planned, executed and verified
    Task,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Task => write!(f, "task"),
        }
    }
}

/// Classification of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeSelection {
    pub mode: Mode,
    /// 0.0-1.0
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

impl ModeSelection {
    /// Used when the classifier is unavailable
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self {
            mode: Mode::Task,
            confidence: 0.5,
            reasoning: reason.into(),
        }
    }
}

/// A tool server as offered to the server selector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub tools: Vec<String>,
}

impl ServerSummary {
    /// Group a `(server, tool)` catalogue by server, keeping first-seen order
    pub fn from_catalog(catalog: &[(String, ToolInfo)]) -> Vec<Self> {
        let mut servers: Vec<Self> = Vec::new();
        for (server, tool) in catalog {
            match servers.iter_mut().find(|s| &s.name == server) {
                Some(summary) => summary.tools.push(tool.name.clone()),
                None => servers.push(Self {
                    name: server.clone(),
                    tools: vec![tool.name.clone()],
                }),
            }
        }
        servers
    }
}

/// Everything the replanner sees about a failed item
#[derive(Debug, Clone, Serialize)]
pub struct ReplanContext {
    pub request: String,
    pub failed_item: TodoItem,
    pub execution: Option<ExecutionResult>,
    pub verification: VerificationResult,
    pub completed: Vec<TodoItem>,
    pub remaining: Vec<TodoItem>,
}

impl ReplanContext {
    pub fn new(
        list: &TodoList,
        failed_item: &TodoItem,
        execution: Option<&ExecutionResult>,
        verification: &VerificationResult,
    ) -> Self {
        Self {
            request: list.request.clone(),
            failed_item: failed_item.clone(),
            execution: execution.cloned(),
            verification: verification.clone(),
            completed: list.completed().cloned().collect(),
            remaining: list
                .remaining()
                .filter(|item| item.id != failed_item.id)
                .cloned()
                .collect(),
        }
    }
}

/// Decides whether a request needs the task pipeline at all
#[async_trait]
pub trait ModeSelector: Send + Sync {
    async fn select_mode(&self, request: &str, history: &[Turn]) -> Result<ModeSelection>;
}

/// Answers a chat-mode request directly
#[async_trait]
pub trait ChatResponder: Send + Sync {
    async fn respond(&self, request: &str, history: &[Turn]) -> Result<String>;
}

/// Narrows the tool catalogue to the servers one item needs
#[async_trait]
pub trait ServerSelector: Send + Sync {
    async fn select_servers(&self, item: &TodoItem, servers: &[ServerSummary])
        -> Result<Vec<String>>;
}

/// Breaks a request into a TODO list
#[async_trait]
pub trait TodoPlanner: Send + Sync {
    async fn plan(&self, request: &str, history: &[Turn]) -> Result<TodoList>;
}

/// Chooses concrete tool calls for one item
#[async_trait]
pub trait ToolPlanner: Send + Sync {
    async fn plan_tools(
        &self,
        item: &TodoItem,
        available: &[(String, ToolInfo)],
    ) -> Result<Vec<PlannedToolCall>>;
}

/// Decides what happens after an item could not be verified
#[async_trait]
pub trait Replanner: Send + Sync {
    async fn decide(&self, context: &ReplanContext) -> Result<PlanningDecision>;
}

/// Runs one attempt of an item
#[async_trait]
pub trait ItemExecutor: Send + Sync {
    async fn execute(&self, item: &TodoItem) -> Result<ExecutionResult>;
}

/// Judges one attempt of an item
#[async_trait]
pub trait ItemVerifier: Send + Sync {
    async fn verify(&self, item: &TodoItem, execution: &ExecutionResult) -> VerificationResult;

    /// Called once an item leaves the list without passing
    fn forget(&self, _item_id: &str) {}
}

#[async_trait]
impl ItemVerifier for VerificationGate {
    async fn verify(&self, item: &TodoItem, execution: &ExecutionResult) -> VerificationResult {
        VerificationGate::verify(self, item, execution).await
    }

    fn forget(&self, item_id: &str) {
        VerificationGate::forget(self, item_id)
    }
}
