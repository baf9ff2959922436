//! Planning decisions, validated at the boundary
//!
//! Planner output is untyped JSON. Nothing touches orchestrator state until it
//! has been turned into a [`PlanningDecision`].

use serde_json::Value;
use triad_agent::extract_json;
use triad_core::{Result, TodoItem, TriadError};

/// What to do with an item that failed verification
#[derive(Debug, Clone, PartialEq)]
pub enum PlanningDecision {
    /// Keep going with the same item
    Continue,
    /// Insert new items right after the failed one and resume there
    Replan { items: Vec<TodoItem> },
    /// Skip the failed item; resume at `continue_from` or the next item
    Skip { continue_from: Option<String> },
    /// Stop the whole list
    Abort { reason: String },
}

impl PlanningDecision {
    pub fn strategy(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Replan { .. } => "replan_and_continue",
            Self::Skip { .. } => "skip_and_continue",
            Self::Abort { .. } => "abort",
        }
    }

    /// Validate a decision object
    ///
    /// ```
    /// use triad_orchestrator::PlanningDecision;
    ///
    /// let decision = PlanningDecision::from_value(&serde_json::json!({
    ///     "strategy": "skip_and_continue",
    ///     "continue_from_item_id": "3"
    /// }))
    /// .unwrap();
    /// assert_eq!(
    ///     decision,
    ///     PlanningDecision::Skip { continue_from: Some("3".to_string()) }
    /// );
    /// ```
    pub fn from_value(value: &Value) -> Result<Self> {
        let strategy = value
            .get("strategy")
            .and_then(Value::as_str)
            .ok_or_else(|| TriadError::InvalidDecision("missing strategy".to_string()))?
            .trim()
            .to_lowercase()
            .replace('-', "_");

        match strategy.as_str() {
            "continue" => Ok(Self::Continue),
            "replan_and_continue" | "replan" => {
                let raw = value
                    .get("new_items")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        TriadError::InvalidDecision("replan without new_items".to_string())
                    })?;
                if raw.is_empty() {
                    return Err(TriadError::InvalidDecision(
                        "replan with empty new_items".to_string(),
                    ));
                }
                let items = raw.iter().map(item_from_value).collect::<Result<Vec<_>>>()?;
                Ok(Self::Replan { items })
            }
            "skip_and_continue" | "skip" => {
                let continue_from = match value.get("continue_from_item_id") {
                    Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                };
                Ok(Self::Skip { continue_from })
            }
            "abort" => {
                let reason = value
                    .get("reason")
                    .or_else(|| value.get("abort_reason"))
                    .and_then(Value::as_str)
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or("planner requested abort")
                    .to_string();
                Ok(Self::Abort { reason })
            }
            other => Err(TriadError::InvalidDecision(format!(
                "unknown strategy: {}",
                other
            ))),
        }
    }

    /// Validate a decision embedded in model output (fenced or bare JSON)
    pub fn from_llm_text(text: &str) -> Result<Self> {
        let value = extract_json(text)
            .map_err(|e| TriadError::InvalidDecision(format!("no decision in reply: {}", e)))?;
        Self::from_value(&value)
    }
}

/// Read one planned item
///
/// `action` is required. Tool names may be given as strings or as objects
/// with a `name` (or `tool`) field.
pub fn item_from_value(value: &Value) -> Result<TodoItem> {
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| TriadError::InvalidDecision("item without action".to_string()))?;

    let strings = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| match entry {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(o) => o
                            .get("name")
                            .or_else(|| o.get("tool"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut item = TodoItem::new(action)
        .with_tools(strings("tools_needed"))
        .with_fallbacks(strings("fallback_options"));
    if let Some(id) = value.get("id") {
        item.id = match id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        };
    }
    if let Some(Value::Object(parameters)) = value.get("parameters") {
        item.parameters = parameters.clone();
    }
    if let Some(criteria) = value.get("success_criteria").and_then(Value::as_str) {
        item.success_criteria = criteria.to_string();
    }
    if let Some(max) = value.get("max_attempts").and_then(Value::as_u64) {
        item.max_attempts = max.min(u32::MAX as u64) as u32;
    }
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_replan_items_are_validated() {
        let decision = PlanningDecision::from_value(&json!({
            "strategy": "replan_and_continue",
            "new_items": [
                {
                    "action": "Open Calculator",
                    "tools_needed": ["developer__shell", {"name": "playwright__browser_click"}],
                    "parameters": {"app": "Calculator"},
                    "success_criteria": "Calculator window visible",
                    "fallback_options": ["Use Spotlight"]
                },
                {"action": "Type 2+2"}
            ]
        }))
        .unwrap();

        let PlanningDecision::Replan { items } = decision else {
            panic!("expected replan");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].tools_needed,
            vec!["developer__shell", "playwright__browser_click"]
        );
        assert_eq!(items[0].parameters["app"], "Calculator");
        assert_eq!(items[0].fallback_options, vec!["Use Spotlight"]);
        assert_eq!(items[1].attempt, 0);
        assert_eq!(items[1].max_attempts, 3);
    }

    #[test]
    fn test_invalid_decisions_rejected() {
        for bad in [
            json!({}),
            json!({"strategy": "teleport"}),
            json!({"strategy": "replan_and_continue"}),
            json!({"strategy": "replan_and_continue", "new_items": []}),
            json!({"strategy": "replan_and_continue", "new_items": [{"action": "  "}]}),
        ] {
            assert!(matches!(
                PlanningDecision::from_value(&bad),
                Err(TriadError::InvalidDecision(_))
            ));
        }
    }

    #[test]
    fn test_skip_and_abort() {
        assert_eq!(
            PlanningDecision::from_value(&json!({"strategy": "skip-and-continue"})).unwrap(),
            PlanningDecision::Skip {
                continue_from: None
            }
        );
        assert_eq!(
            PlanningDecision::from_value(&json!({"strategy": "skip", "continue_from_item_id": 4}))
                .unwrap(),
            PlanningDecision::Skip {
                continue_from: Some("4".to_string())
            }
        );
        assert_eq!(
            PlanningDecision::from_value(&json!({"strategy": "ABORT", "reason": "no display"}))
                .unwrap(),
            PlanningDecision::Abort {
                reason: "no display".to_string()
            }
        );
        assert_eq!(
            PlanningDecision::from_value(&json!({"strategy": "continue"}))
                .unwrap()
                .strategy(),
            "continue"
        );
    }

    #[test]
    fn test_from_llm_text() {
        let text = "Decision:\n```json\n{\"strategy\": \"abort\", \"abort_reason\": \"unsafe\"}\n```";
        assert_eq!(
            PlanningDecision::from_llm_text(text).unwrap(),
            PlanningDecision::Abort {
                reason: "unsafe".to_string()
            }
        );
        assert!(matches!(
            PlanningDecision::from_llm_text("I think we should give up"),
            Err(TriadError::InvalidDecision(_))
        ));
    }
}
