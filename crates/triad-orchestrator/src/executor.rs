//! Executes an item's tool calls through the tool process manager

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use triad_core::fail_open::fail_open;
use triad_core::{ExecutionResult, Result, TodoItem, ToolDispatcher, ToolInfo, ToolRun};

use crate::prompt::MAX_SELECTED_SERVERS;
use crate::roles::{ItemExecutor, ServerSelector, ServerSummary, ToolPlanner};

/// Plans tool calls for an item, then runs them one after another
///
/// A failing tool is recorded and the remaining calls still run; the
/// verifier decides what the combined effect was. Only a failure to plan
/// is an error.
pub struct ToolExecutor {
    dispatcher: Arc<dyn ToolDispatcher>,
    catalog: Vec<(String, ToolInfo)>,
    planner: Arc<dyn ToolPlanner>,
    selector: Option<Arc<dyn ServerSelector>>,
}

impl ToolExecutor {
    /// `catalog` is the `(server, tool)` list offered to the planner
    pub fn new(
        dispatcher: Arc<dyn ToolDispatcher>,
        catalog: Vec<(String, ToolInfo)>,
        planner: Arc<dyn ToolPlanner>,
    ) -> Self {
        Self {
            dispatcher,
            catalog,
            planner,
            selector: None,
        }
    }

    /// Offer the planner only the servers `selector` picks for each item
    pub fn with_server_selector(mut self, selector: Arc<dyn ServerSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// The part of the catalogue offered for `item`
    ///
    /// The whole catalogue when there is no selector, at most one server, or
    /// the selector fails or picks nothing usable.
    async fn catalog_for(&self, item: &TodoItem) -> Vec<(String, ToolInfo)> {
        let Some(selector) = &self.selector else {
            return self.catalog.clone();
        };
        let servers = ServerSummary::from_catalog(&self.catalog);
        if servers.len() <= 1 {
            return self.catalog.clone();
        }

        let selected = fail_open("server_selection", || selector.select_servers(item, &servers))
            .await
            .unwrap_or_default();
        let selected: Vec<&String> = selected
            .iter()
            .filter(|name| servers.iter().any(|s| &s.name == *name))
            .take(MAX_SELECTED_SERVERS)
            .collect();
        if selected.is_empty() {
            debug!(item_id = %item.id, "No server selection, offering every server");
            return self.catalog.clone();
        }

        debug!(item_id = %item.id, servers = ?selected, "Catalogue narrowed");
        self.catalog
            .iter()
            .filter(|(server, _)| selected.iter().any(|name| *name == server))
            .cloned()
            .collect()
    }

    fn server_for(&self, tool: &str) -> Option<&str> {
        self.catalog
            .iter()
            .find(|(_, info)| info.name == tool)
            .map(|(server, _)| server.as_str())
    }
}

#[async_trait]
impl ItemExecutor for ToolExecutor {
    async fn execute(&self, item: &TodoItem) -> Result<ExecutionResult> {
        let catalog = self.catalog_for(item).await;
        let calls = self.planner.plan_tools(item, &catalog).await?;

        let mut runs = Vec::with_capacity(calls.len());
        for call in calls {
            let started = Instant::now();
            let arguments = match call.arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            };
            let outcome = self.dispatcher.dispatch(&call.tool, arguments).await;
            let elapsed = started.elapsed().as_millis() as u64;

            let run = match outcome {
                Ok(output) => ToolRun::succeeded(&call.tool, output, elapsed),
                Err(e) => {
                    warn!(item_id = %item.id, tool = %call.tool, "Tool call failed: {}", e);
                    ToolRun::failed(&call.tool, e.to_string(), elapsed)
                }
            };
            let server = call
                .server
                .as_deref()
                .or_else(|| self.server_for(&call.tool))
                .map(str::to_string);
            runs.push(match server {
                Some(server) => run.with_server(server),
                None => run,
            });
        }

        let result = ExecutionResult::from_runs(&item.id, item.attempt, runs);
        info!(item_id = %item.id, attempt = item.attempt, summary = %result.summary, "Item executed");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::PlannedToolCall;
    use serde_json::json;
    use std::sync::Mutex;
    use triad_core::TriadError;

    struct FixedPlan(Vec<PlannedToolCall>);

    #[async_trait]
    impl ToolPlanner for FixedPlan {
        async fn plan_tools(
            &self,
            _item: &TodoItem,
            _available: &[(String, ToolInfo)],
        ) -> Result<Vec<PlannedToolCall>> {
            Ok(self.0.clone())
        }
    }

    /// Records the catalogue it was offered and plans nothing
    #[derive(Default)]
    struct SeenCatalog(Mutex<Vec<String>>);

    #[async_trait]
    impl ToolPlanner for SeenCatalog {
        async fn plan_tools(
            &self,
            _item: &TodoItem,
            available: &[(String, ToolInfo)],
        ) -> Result<Vec<PlannedToolCall>> {
            *self.0.lock().unwrap() = available.iter().map(|(_, t)| t.name.clone()).collect();
            Ok(vec![])
        }
    }

    /// Returns a fixed answer and counts how often it was asked
    struct FixedServers {
        answer: Result<Vec<String>>,
        asked: Mutex<u32>,
    }

    impl FixedServers {
        fn new(answer: Result<Vec<String>>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                asked: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl ServerSelector for FixedServers {
        async fn select_servers(
            &self,
            _item: &TodoItem,
            _servers: &[ServerSummary],
        ) -> Result<Vec<String>> {
            *self.asked.lock().unwrap() += 1;
            match &self.answer {
                Ok(names) => Ok(names.clone()),
                Err(_) => Err(TriadError::Llm("selector down".to_string())),
            }
        }
    }

    struct NoPlan;

    #[async_trait]
    impl ToolPlanner for NoPlan {
        async fn plan_tools(
            &self,
            _item: &TodoItem,
            _available: &[(String, ToolInfo)],
        ) -> Result<Vec<PlannedToolCall>> {
            Err(TriadError::Llm("planner down".to_string()))
        }
    }

    /// Echoes arguments back; `broken` always fails
    #[derive(Default)]
    struct MockDispatcher {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ToolDispatcher for MockDispatcher {
        async fn dispatch(&self, tool: &str, arguments: Value) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((tool.to_string(), arguments.clone()));
            if tool == "broken" {
                return Err(TriadError::ToolError {
                    code: -32000,
                    message: "boom".to_string(),
                });
            }
            Ok(arguments)
        }
    }

    fn call(tool: &str, arguments: Value) -> PlannedToolCall {
        PlannedToolCall {
            tool: tool.to_string(),
            server: None,
            arguments,
        }
    }

    fn tool(name: &str) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: None,
            input_schema: None,
        }
    }

    fn wide_catalog() -> Vec<(String, ToolInfo)> {
        vec![
            ("desktop".to_string(), tool("click")),
            ("files".to_string(), tool("read_file")),
            ("browser".to_string(), tool("open_url")),
            ("desktop".to_string(), tool("type_text")),
        ]
    }

    /// Tool names the planner was offered for one item
    async fn offered(
        selector: Option<Arc<FixedServers>>,
        catalog: Vec<(String, ToolInfo)>,
    ) -> Vec<String> {
        let seen = Arc::new(SeenCatalog::default());
        let mut executor =
            ToolExecutor::new(Arc::new(MockDispatcher::default()), catalog, seen.clone());
        if let Some(selector) = selector {
            executor = executor.with_server_selector(selector);
        }
        executor.execute(&TodoItem::new("x").with_id("1")).await.unwrap();
        let names = seen.0.lock().unwrap().clone();
        names
    }

    fn catalog() -> Vec<(String, ToolInfo)> {
        vec![(
            "desktop".to_string(),
            ToolInfo {
                name: "type_text".to_string(),
                description: None,
                input_schema: None,
            },
        )]
    }

    #[tokio::test]
    async fn test_runs_all_calls_in_order() {
        let dispatcher = Arc::new(MockDispatcher::default());
        let executor = ToolExecutor::new(
            dispatcher.clone(),
            catalog(),
            Arc::new(FixedPlan(vec![
                call("type_text", json!({"text": "2+2"})),
                call("broken", Value::Null),
                call("type_text", json!({"text": "="})),
            ])),
        );
        let mut item = TodoItem::new("Type 2+2").with_id("1");
        item.attempt = 2;

        let result = executor.execute(&item).await.unwrap();
        assert_eq!(result.item_id, "1");
        assert_eq!(result.attempt, 2);
        assert_eq!(result.tools_used(), vec!["type_text", "broken", "type_text"]);
        assert!(!result.all_succeeded());
        assert_eq!(result.runs[0].server.as_deref(), Some("desktop"));
        assert_eq!(result.runs[1].server, None);
        assert!(result.summary.starts_with("2/3 tools succeeded"));
        assert!(result.summary.contains("broken failed"));

        let calls = dispatcher.calls.lock().unwrap();
        assert_eq!(calls[1].1, json!({}));
    }

    #[tokio::test]
    async fn test_planning_failure_is_an_error() {
        let executor = ToolExecutor::new(
            Arc::new(MockDispatcher::default()),
            vec![],
            Arc::new(NoPlan),
        );
        assert!(executor.execute(&TodoItem::new("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_server_selection_narrows_catalog() {
        let selector = FixedServers::new(Ok(vec!["desktop".to_string(), "files".to_string()]));
        assert_eq!(
            offered(Some(selector.clone()), wide_catalog()).await,
            vec!["click", "read_file", "type_text"]
        );
        assert_eq!(*selector.asked.lock().unwrap(), 1);

        assert_eq!(offered(None, wide_catalog()).await.len(), 4);
    }

    #[tokio::test]
    async fn test_server_selection_falls_back_to_full_catalog() {
        let failing = FixedServers::new(Err(TriadError::Llm(String::new())));
        assert_eq!(offered(Some(failing), wide_catalog()).await.len(), 4);

        let unknown = FixedServers::new(Ok(vec!["mail".to_string()]));
        assert_eq!(offered(Some(unknown), wide_catalog()).await.len(), 4);

        let single = FixedServers::new(Ok(vec!["desktop".to_string()]));
        assert_eq!(
            offered(Some(single.clone()), catalog()).await,
            vec!["type_text"]
        );
        assert_eq!(*single.asked.lock().unwrap(), 0);
    }
}
