//! LLM-backed planning roles

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use triad_agent::{ChatMessage, LlmClient};
use triad_core::{Result, TodoItem, TodoList, ToolInfo, TriadError};

use crate::decision::PlanningDecision;
use crate::prompt::{
    build_chat_prompt, build_mode_prompt, build_replan_prompt, build_server_selection_prompt,
    build_todo_prompt, build_tool_plan_prompt, parse_mode_selection, parse_server_selection,
    parse_todo_items, parse_tool_calls,
};
use crate::roles::{
    ChatResponder, ModeSelection, ModeSelector, PlannedToolCall, ReplanContext, Replanner,
    ServerSelector, ServerSummary, TodoPlanner, ToolPlanner,
};
use crate::session::Turn;

async fn ask(llm: &LlmClient, (system, user): (String, String)) -> Result<String> {
    llm.complete(vec![ChatMessage::system(system), ChatMessage::user(user)])
        .await
}

pub struct LlmModeSelector {
    llm: Arc<LlmClient>,
}

impl LlmModeSelector {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ModeSelector for LlmModeSelector {
    async fn select_mode(&self, request: &str, history: &[Turn]) -> Result<ModeSelection> {
        let reply = ask(&self.llm, build_mode_prompt(request, history)).await?;
        let selection = parse_mode_selection(&reply);
        info!(mode = %selection.mode, confidence = selection.confidence, "Mode selected");
        Ok(selection)
    }
}

pub struct LlmChatResponder {
    llm: Arc<LlmClient>,
}

impl LlmChatResponder {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ChatResponder for LlmChatResponder {
    async fn respond(&self, request: &str, history: &[Turn]) -> Result<String> {
        let reply = ask(&self.llm, build_chat_prompt(request, history)).await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(TriadError::Llm("empty chat reply".to_string()));
        }
        Ok(reply.to_string())
    }
}

pub struct LlmServerSelector {
    llm: Arc<LlmClient>,
}

impl LlmServerSelector {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ServerSelector for LlmServerSelector {
    async fn select_servers(
        &self,
        item: &TodoItem,
        servers: &[ServerSummary],
    ) -> Result<Vec<String>> {
        let reply = ask(&self.llm, build_server_selection_prompt(item, servers)).await?;
        let selected = parse_server_selection(&reply, servers)?;
        debug!(item_id = %item.id, servers = ?selected, "Servers selected");
        Ok(selected)
    }
}

pub struct LlmTodoPlanner {
    llm: Arc<LlmClient>,
    max_attempts: u32,
}

impl LlmTodoPlanner {
    pub fn new(llm: Arc<LlmClient>, max_attempts: u32) -> Self {
        Self { llm, max_attempts }
    }
}

#[async_trait]
impl TodoPlanner for LlmTodoPlanner {
    async fn plan(&self, request: &str, history: &[Turn]) -> Result<TodoList> {
        let reply = ask(&self.llm, build_todo_prompt(request, history)).await?;
        let items = parse_todo_items(&reply)?
            .into_iter()
            .map(|item| item.with_max_attempts(self.max_attempts))
            .collect::<Vec<_>>();
        if items.is_empty() {
            return Err(TriadError::Llm("planner produced no items".to_string()));
        }
        info!(items = items.len(), model = %self.llm.model(), "TODO list planned");
        Ok(TodoList::new(request, items))
    }
}

pub struct LlmToolPlanner {
    llm: Arc<LlmClient>,
}

impl LlmToolPlanner {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ToolPlanner for LlmToolPlanner {
    async fn plan_tools(
        &self,
        item: &TodoItem,
        available: &[(String, ToolInfo)],
    ) -> Result<Vec<PlannedToolCall>> {
        let reply = ask(&self.llm, build_tool_plan_prompt(item, available)).await?;
        let calls = parse_tool_calls(&reply)?;
        debug!(item_id = %item.id, calls = calls.len(), "Tool calls planned");
        Ok(calls)
    }
}

pub struct LlmReplanner {
    llm: Arc<LlmClient>,
}

impl LlmReplanner {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Replanner for LlmReplanner {
    async fn decide(&self, context: &ReplanContext) -> Result<PlanningDecision> {
        let reply = ask(&self.llm, build_replan_prompt(context)).await?;
        let decision = PlanningDecision::from_llm_text(&reply)?;
        info!(
            item_id = %context.failed_item.id,
            strategy = decision.strategy(),
            "Replanning decision"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use triad_core::config::LlmConfig;
    use triad_core::VerificationResult;

    /// Answer one chat request with `content` as the assistant message
    async fn chat_server(content: &str) -> Arc<LlmClient> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = serde_json::json!({
            "choices": [{"message": {"content": content}}]
        })
        .to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        let config = LlmConfig {
            endpoint: format!("http://{}/v1/chat/completions", addr),
            ..LlmConfig::default()
        };
        Arc::new(LlmClient::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_todo_planner_builds_list() {
        let llm = chat_server(
            "```json\n{\"items\": [{\"action\": \"Open Calculator\", \"success_criteria\": \"window visible\"}, \
             {\"action\": \"Type 2+2\"}]}\n```",
        )
        .await;
        let list = LlmTodoPlanner::new(llm, 4)
            .plan("add 2 and 2", &[])
            .await
            .unwrap();
        assert_eq!(list.request, "add 2 and 2");
        assert_eq!(list.len(), 2);
        assert_eq!(list.items[0].id, "1");
        assert_eq!(list.items[1].id, "2");
        assert_eq!(list.items[0].max_attempts, 4);
        assert_eq!(list.items[0].success_criteria, "window visible");
    }

    #[tokio::test]
    async fn test_empty_plan_is_an_error() {
        let llm = chat_server("{\"items\": []}").await;
        assert!(LlmTodoPlanner::new(llm, 3).plan("x", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_tool_planner_parses_calls() {
        let llm = chat_server("{\"tool_calls\": [{\"tool\": \"echo\", \"arguments\": {\"text\": \"hi\"}}]}").await;
        let calls = LlmToolPlanner::new(llm)
            .plan_tools(&TodoItem::new("say hi"), &[])
            .await
            .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool, "echo");
    }

    #[tokio::test]
    async fn test_mode_selector_reads_verdict() {
        let llm = chat_server("{\"mode\": \"chat\", \"confidence\": 0.95, \"reasoning\": \"greeting\"}").await;
        let selection = LlmModeSelector::new(llm).select_mode("hello!", &[]).await.unwrap();
        assert_eq!(selection.mode, crate::roles::Mode::Chat);
        assert_eq!(selection.confidence, 0.95);
    }

    #[tokio::test]
    async fn test_chat_responder_trims_reply() {
        let llm = chat_server("  Hi there.\n").await;
        assert_eq!(
            LlmChatResponder::new(llm).respond("hello", &[]).await.unwrap(),
            "Hi there."
        );

        let silent = chat_server("   ").await;
        assert!(LlmChatResponder::new(silent).respond("hello", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_server_selector_rejects_unknown_names() {
        let servers = vec![
            ServerSummary {
                name: "desktop".to_string(),
                tools: vec!["click".to_string()],
            },
            ServerSummary {
                name: "files".to_string(),
                tools: vec!["read_file".to_string()],
            },
        ];
        let llm = chat_server("{\"selected_servers\": [\"files\"]}").await;
        assert_eq!(
            LlmServerSelector::new(llm)
                .select_servers(&TodoItem::new("read notes"), &servers)
                .await
                .unwrap(),
            vec!["files"]
        );

        let wrong = chat_server("{\"selected_servers\": [\"mail\"]}").await;
        assert!(LlmServerSelector::new(wrong)
            .select_servers(&TodoItem::new("read notes"), &servers)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_replanner_validates_decision() {
        let llm = chat_server("{\"strategy\": \"skip_and_continue\"}").await;
        let list = TodoList::new("r", vec![TodoItem::new("a")]);
        let context = ReplanContext::new(
            &list,
            &list.items[0],
            None,
            &VerificationResult::analysis_failure("1", "x"),
        );
        assert_eq!(
            LlmReplanner::new(llm).decide(&context).await.unwrap(),
            PlanningDecision::Skip {
                continue_from: None
            }
        );

        let confused = chat_server("{\"strategy\": \"dance\"}").await;
        assert!(matches!(
            LlmReplanner::new(confused).decide(&context).await,
            Err(TriadError::InvalidDecision(_))
        ));
    }
}
