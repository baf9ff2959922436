//! Wire format of the agent transport
//!
//! Outbound frames are a single `message` per exchange plus `tool_response`
//! replies. Inbound frames are parsed leniently: the runtime is not strict
//! about field names, so content and ids are looked up in a few places.

use serde::Serialize;
use serde_json::Value;

/// Error texts that mean the prompt exceeded the remote model's input limit
const PROMPT_TOO_LARGE_MARKERS: [&str; 3] = [
    "model_max_prompt_tokens_exceeded",
    "prompt token count",
    "exceeds the limit",
];

/// The prompt sent to the agent
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub content: String,
    pub session_id: String,
    /// Unix epoch millis
    pub timestamp: i64,
}

impl OutboundMessage {
    pub fn new(content: String, session_id: String) -> Self {
        Self {
            kind: "message",
            content,
            session_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Reply to a `tool_request`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResponseFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub tool_call_id: String,
    pub content: String,
    pub success: bool,
}

impl ToolResponseFrame {
    pub fn new(tool_call_id: String, content: impl Into<String>, success: bool) -> Self {
        Self {
            kind: "tool_response",
            tool_call_id,
            content: content.into(),
            success,
        }
    }
}

/// A parsed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Response {
        content: String,
    },
    ToolRequest {
        tool_name: String,
        tool_call_id: String,
        arguments: Value,
    },
    ToolResponse {
        tool_call_id: Option<String>,
    },
    Complete,
    Cancelled,
    Error {
        message: String,
    },
    Unknown {
        kind: String,
    },
}

/// An inbound frame together with the session it claims to belong to
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub session_id: Option<String>,
    pub event: InboundEvent,
}

impl InboundFrame {
    /// Parse a text frame; `None` when it is not a JSON object
    pub fn parse(text: &str) -> Option<Self> {
        let obj: Value = serde_json::from_str(text).ok()?;
        if !obj.is_object() {
            return None;
        }
        let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
        let session_id = obj
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let event = match kind {
            "response" => InboundEvent::Response {
                content: response_content(&obj),
            },
            "tool_request" => InboundEvent::ToolRequest {
                tool_name: first_str(&obj, &["tool_name", "name"]).unwrap_or_default(),
                tool_call_id: first_str(&obj, &["tool_call_id", "id"]).unwrap_or_else(|| {
                    format!("fake_{}", chrono::Utc::now().timestamp_millis())
                }),
                arguments: obj
                    .get("arguments")
                    .or_else(|| obj.get("args"))
                    .cloned()
                    .unwrap_or(Value::Null),
            },
            "tool_response" => InboundEvent::ToolResponse {
                tool_call_id: first_str(&obj, &["tool_call_id", "id"]),
            },
            "complete" => InboundEvent::Complete,
            "cancelled" => InboundEvent::Cancelled,
            "error" => InboundEvent::Error {
                message: error_text(&obj),
            },
            other => InboundEvent::Unknown {
                kind: other.to_string(),
            },
        };

        Some(Self { session_id, event })
    }
}

/// Whether an error text is the actionable "prompt too large" class
pub fn is_prompt_too_large(message: &str) -> bool {
    PROMPT_TOO_LARGE_MARKERS.iter().any(|m| message.contains(m))
}

/// Advisory returned in place of a prompt-too-large error
pub const PROMPT_TOO_LARGE_ADVISORY: &str = "Error: the request context is too large \
(prompt token limit exceeded). Simplify the task or clear the conversation history.";

fn first_str(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn response_content(obj: &Value) -> String {
    obj.get("content")
        .and_then(value_text)
        .or_else(|| {
            obj.get("message")
                .and_then(|m| m.get("content"))
                .and_then(value_text)
        })
        .unwrap_or_default()
}

fn error_text(obj: &Value) -> String {
    obj.get("error")
        .and_then(value_text)
        .or_else(|| obj.get("message").and_then(value_text))
        .unwrap_or_else(|| "Unknown error".to_string())
}
