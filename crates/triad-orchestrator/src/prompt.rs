//! Prompt builders and reply parsers for the planning roles
//!
//! Each builder returns a `(system, user)` pair. Replies are expected to be a
//! JSON object, possibly fenced; parsers accept the shapes models actually
//! produce.

use serde_json::Value;
use triad_agent::extract_json;
use triad_core::{Result, TodoItem, ToolInfo, TriadError};

use crate::decision::item_from_value;
use crate::roles::{Mode, ModeSelection, PlannedToolCall, ReplanContext, ServerSummary};
use crate::session::Turn;

/// Servers an item may be narrowed to
pub const MAX_SELECTED_SERVERS: usize = 2;

/// Tool names listed per server before the rest are counted
const LISTED_TOOLS: usize = 5;

const MODE_SYSTEM: &str = "You are the dispatcher. Decide whether the user's message is chat \
(a question, greeting or discussion you can answer directly) or a task (something that needs \
actions on the computer). Reply with ONLY a JSON object.";

const CHAT_SYSTEM: &str = "You are the assistant. Answer the user's message directly and \
briefly. Do not claim to have performed any action.";

const SERVER_SYSTEM: &str = "You are the executor. Choose the tool servers one TODO item \
needs, at most two, using only the listed names. Reply with ONLY a JSON object.";

const TODO_SYSTEM: &str = "You are the planner. Break the user's request into a short \
ordered list of atomic TODO items. Each item needs a concrete action, the tools it needs and a \
success criterion that can be checked on screen. Reply with ONLY a JSON object.";

const TOOL_SYSTEM: &str = "You are the executor. Choose the tool calls that carry out one \
TODO item, using only the listed tools. Reply with ONLY a JSON object.";

const REPLAN_SYSTEM: &str = "You are the planner reviewing a TODO item that failed \
verification. Choose exactly one strategy: continue, replan_and_continue, skip_and_continue or \
abort. Reply with ONLY a JSON object.";

fn push_history(prompt: &mut String, history: &[Turn]) {
    if history.is_empty() {
        return;
    }
    prompt.push_str("## CONVERSATION SO FAR\n\n");
    for turn in history {
        prompt.push_str(&format!("{}: {}\n", turn.role, turn.content));
    }
    prompt.push('\n');
}

pub fn build_mode_prompt(request: &str, history: &[Turn]) -> (String, String) {
    let mut prompt = String::new();
    push_history(&mut prompt, history);
    prompt.push_str("## MESSAGE\n\n");
    prompt.push_str(request);
    prompt.push_str("\n\n## FORMAT\n\n");
    prompt.push_str(
        "{\"mode\": \"chat\" | \"task\", \"confidence\": 0.0-1.0, \"reasoning\": \"...\"}\n",
    );
    (MODE_SYSTEM.to_string(), prompt)
}

pub fn build_chat_prompt(request: &str, history: &[Turn]) -> (String, String) {
    let mut prompt = String::new();
    push_history(&mut prompt, history);
    prompt.push_str(request);
    (CHAT_SYSTEM.to_string(), prompt)
}

pub fn build_server_selection_prompt(
    item: &TodoItem,
    servers: &[ServerSummary],
) -> (String, String) {
    let mut prompt = String::new();

    prompt.push_str("## ITEM\n\n");
    prompt.push_str(&format!("- id: {}\n- action: {}\n", item.id, item.action));
    if !item.success_criteria.is_empty() {
        prompt.push_str(&format!("- success criteria: {}\n", item.success_criteria));
    }
    if !item.tools_needed.is_empty() {
        prompt.push_str(&format!("- suggested tools: {}\n", item.tools_needed.join(", ")));
    }

    prompt.push_str("\n## SERVERS\n\n");
    for server in servers {
        let shown: Vec<&str> = server
            .tools
            .iter()
            .take(LISTED_TOOLS)
            .map(String::as_str)
            .collect();
        prompt.push_str(&format!(
            "- **{}** ({} tools): {}",
            server.name,
            server.tools.len(),
            shown.join(", ")
        ));
        if server.tools.len() > LISTED_TOOLS {
            prompt.push_str(&format!(" (+{} more)", server.tools.len() - LISTED_TOOLS));
        }
        prompt.push('\n');
    }

    prompt.push_str("\n## FORMAT\n\n");
    prompt.push_str("{\"selected_servers\": [\"...\"], \"reasoning\": \"...\"}\n");

    (SERVER_SYSTEM.to_string(), prompt)
}

pub fn build_todo_prompt(request: &str, history: &[Turn]) -> (String, String) {
    let mut prompt = String::new();
    push_history(&mut prompt, history);

    prompt.push_str("## REQUEST\n\n");
    prompt.push_str(request);
    prompt.push_str("\n\n## FORMAT\n\n");
    prompt.push_str(
        "{\"items\": [{\"action\": \"...\", \"tools_needed\": [\"...\"], \
         \"parameters\": {}, \"success_criteria\": \"...\", \"fallback_options\": [\"...\"]}]}\n",
    );

    (TODO_SYSTEM.to_string(), prompt)
}

pub fn build_tool_plan_prompt(item: &TodoItem, available: &[(String, ToolInfo)]) -> (String, String) {
    let mut prompt = String::new();

    prompt.push_str("## ITEM\n\n");
    prompt.push_str(&format!("**Action:** {}\n", item.action));
    if !item.success_criteria.is_empty() {
        prompt.push_str(&format!("**Success criteria:** {}\n", item.success_criteria));
    }
    if !item.tools_needed.is_empty() {
        prompt.push_str(&format!("**Suggested tools:** {}\n", item.tools_needed.join(", ")));
    }
    if !item.parameters.is_empty() {
        prompt.push_str(&format!(
            "**Parameters:** {}\n",
            Value::Object(item.parameters.clone())
        ));
    }
    if let Some(failure) = &item.last_failure {
        prompt.push_str(&format!("**Previous attempt failed:** {}\n", failure));
    }

    prompt.push_str("\n## AVAILABLE TOOLS\n\n");
    if available.is_empty() {
        prompt.push_str("(none)\n");
    }
    for (server, tool) in available {
        prompt.push_str(&format!("- {} ({})", tool.name, server));
        if let Some(description) = &tool.description {
            prompt.push_str(&format!(": {}", description));
        }
        prompt.push('\n');
        if let Some(schema) = &tool.input_schema {
            prompt.push_str(&format!("  input: {}\n", schema));
        }
    }

    prompt.push_str("\n## FORMAT\n\n");
    prompt.push_str(
        "{\"tool_calls\": [{\"tool\": \"...\", \"server\": \"...\", \"arguments\": {}}]}\n",
    );

    (TOOL_SYSTEM.to_string(), prompt)
}

pub fn build_replan_prompt(context: &ReplanContext) -> (String, String) {
    let mut prompt = String::new();
    let item = &context.failed_item;
    let verification = &context.verification;

    prompt.push_str("## ORIGINAL REQUEST\n\n");
    prompt.push_str(&context.request);
    prompt.push_str("\n\n## FAILED ITEM\n\n");
    prompt.push_str(&format!(
        "- id: {}\n- action: {}\n- success criteria: {}\n- attempts: {}/{}\n",
        item.id, item.action, item.success_criteria, item.attempt, item.max_attempts
    ));
    if !item.fallback_options.is_empty() {
        prompt.push_str(&format!("- fallbacks: {}\n", item.fallback_options.join("; ")));
    }

    if let Some(execution) = &context.execution {
        prompt.push_str(&format!("\n## EXECUTION\n\n{}\n", execution.summary));
    }

    prompt.push_str("\n## VERIFICATION\n\n");
    prompt.push_str(&format!(
        "- verified: {}\n- confidence: {}\n- reason: {}\n",
        verification.verified, verification.confidence, verification.reason
    ));
    if let Some(cause) = verification.failure_cause {
        prompt.push_str(&format!("- failure cause: {}\n", cause));
    }
    if let Some(strategy) = verification.recommended_strategy {
        prompt.push_str(&format!("- recommended strategy: {}\n", strategy));
    }

    if !context.completed.is_empty() {
        prompt.push_str("\n## COMPLETED\n\n");
        for done in &context.completed {
            prompt.push_str(&format!("- [x] {} {}\n", done.id, done.action));
        }
    }
    if !context.remaining.is_empty() {
        prompt.push_str("\n## REMAINING\n\n");
        for next in &context.remaining {
            prompt.push_str(&format!("- [ ] {} {}\n", next.id, next.action));
        }
    }

    prompt.push_str("\n## FORMAT\n\n");
    prompt.push_str(
        "{\"strategy\": \"replan_and_continue\", \"new_items\": [{\"action\": \"...\", \
         \"tools_needed\": [], \"parameters\": {}, \"success_criteria\": \"...\", \
         \"fallback_options\": []}]}\n\
         {\"strategy\": \"skip_and_continue\", \"continue_from_item_id\": \"...\"}\n\
         {\"strategy\": \"abort\", \"reason\": \"...\"}\n\
         {\"strategy\": \"continue\"}\n",
    );

    (REPLAN_SYSTEM.to_string(), prompt)
}

/// The array under `key`, or the whole value when it is already an array
fn list_under<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    if let Some(array) = value.as_array() {
        return Some(array);
    }
    keys.iter().find_map(|key| value.get(*key).and_then(Value::as_array))
}

/// Mode from a dispatcher reply
///
/// Never fails. A reply that is not a usable object is read by looking for a
/// chat verdict in the raw text, at reduced confidence.
pub fn parse_mode_selection(reply: &str) -> ModeSelection {
    let parsed = extract_json(reply).ok().and_then(|value| {
        let mode = match value.get("mode").and_then(Value::as_str)?.trim() {
            m if m.eq_ignore_ascii_case("chat") => Mode::Chat,
            m if m.eq_ignore_ascii_case("task") => Mode::Task,
            _ => return None,
        };
        let confidence = value
            .get("confidence")
            .and_then(Value::as_f64)
            .map(|c| if c > 1.0 { c / 100.0 } else { c })
            .unwrap_or(0.7)
            .clamp(0.0, 1.0);
        Some(ModeSelection {
            mode,
            confidence,
            reasoning: value
                .get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    });
    if let Some(selection) = parsed {
        return selection;
    }

    let compact: String = reply
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    let mode = if compact.contains("\"mode\":\"chat\"") {
        Mode::Chat
    } else {
        Mode::Task
    };
    ModeSelection {
        mode,
        confidence: 0.7,
        reasoning: "unstructured dispatcher reply".to_string(),
    }
}

/// Server names from a selector reply, checked against what was offered
///
/// Duplicates are dropped and at most [`MAX_SELECTED_SERVERS`] are kept. An
/// empty selection or a name that was not offered is an error.
pub fn parse_server_selection(reply: &str, servers: &[ServerSummary]) -> Result<Vec<String>> {
    let value = extract_json(reply)?;
    let raw = list_under(&value, &["selected_servers", "servers"]).ok_or_else(|| {
        TriadError::MalformedPayload("server selection has no selected_servers".to_string())
    })?;

    let mut selected: Vec<String> = Vec::new();
    for entry in raw {
        let name = entry
            .as_str()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| TriadError::MalformedPayload("server name is not a string".to_string()))?;
        if !servers.iter().any(|s| s.name == name) {
            return Err(TriadError::MalformedPayload(format!(
                "unknown server '{}'",
                name
            )));
        }
        if !selected.iter().any(|s| s == name) {
            selected.push(name.to_string());
        }
    }
    if selected.is_empty() {
        return Err(TriadError::MalformedPayload(
            "server selection is empty".to_string(),
        ));
    }
    selected.truncate(MAX_SELECTED_SERVERS);
    Ok(selected)
}

/// Items from a planner reply
pub fn parse_todo_items(reply: &str) -> Result<Vec<TodoItem>> {
    let value = extract_json(reply)?;
    let raw = list_under(&value, &["items", "todo_list", "todo"])
        .ok_or_else(|| TriadError::MalformedPayload("planner reply has no items".to_string()))?;
    raw.iter().map(item_from_value).collect()
}

/// Tool calls from an executor-planner reply
pub fn parse_tool_calls(reply: &str) -> Result<Vec<PlannedToolCall>> {
    let value = extract_json(reply)?;
    let raw = list_under(&value, &["tool_calls", "calls", "tools"]).ok_or_else(|| {
        TriadError::MalformedPayload("tool plan reply has no tool_calls".to_string())
    })?;

    raw.iter()
        .map(|call| {
            let tool = call
                .get("tool")
                .or_else(|| call.get("name"))
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| TriadError::MalformedPayload("tool call without tool".to_string()))?;
            Ok(PlannedToolCall {
                tool: tool.to_string(),
                server: call.get("server").and_then(Value::as_str).map(str::to_string),
                arguments: call
                    .get("arguments")
                    .or_else(|| call.get("parameters"))
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default())),
            })
        })
        .collect()
}
