//! Events streamed to callers of `Orchestrator::orchestrate`

use serde::{Deserialize, Serialize};
use triad_core::{ExecutionResult, TodoItem, TodoSummary, VerificationResult};

use crate::roles::Mode;

/// One step of a run, in the order it happened
///
/// Every stream ends with exactly one terminal event: `WorkflowComplete` or
/// `WorkflowAborted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageEvent {
    /// Only emitted when mode selection is enabled
    ModeSelected {
        mode: Mode,
        confidence: f64,
        reasoning: String,
    },
    ChatReplied {
        content: String,
    },
    PlanningStarted {
        session_id: String,
        request: String,
    },
    TodoCreated {
        list_id: String,
        items: Vec<TodoItem>,
    },
    ItemStarted {
        item_id: String,
        action: String,
        attempt: u32,
    },
    ItemExecuted {
        result: ExecutionResult,
    },
    ItemVerified {
        result: VerificationResult,
    },
    ItemRetry {
        item_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    ItemAdjusted {
        item_id: String,
        strategy: String,
    },
    ItemSkipped {
        item_id: String,
        reason: String,
    },
    ItemFailed {
        item_id: String,
        reason: String,
    },
    Replanned {
        after_item_id: String,
        inserted: Vec<String>,
    },
    WorkflowComplete {
        summary: TodoSummary,
    },
    WorkflowAborted {
        reason: String,
    },
}

impl StageEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowComplete { .. } | Self::WorkflowAborted { .. }
        )
    }

    /// The wire tag of this event
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModeSelected { .. } => "mode_selected",
            Self::ChatReplied { .. } => "chat_replied",
            Self::PlanningStarted { .. } => "planning_started",
            Self::TodoCreated { .. } => "todo_created",
            Self::ItemStarted { .. } => "item_started",
            Self::ItemExecuted { .. } => "item_executed",
            Self::ItemVerified { .. } => "item_verified",
            Self::ItemRetry { .. } => "item_retry",
            Self::ItemAdjusted { .. } => "item_adjusted",
            Self::ItemSkipped { .. } => "item_skipped",
            Self::ItemFailed { .. } => "item_failed",
            Self::Replanned { .. } => "replanned",
            Self::WorkflowComplete { .. } => "workflow_complete",
            Self::WorkflowAborted { .. } => "workflow_aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let event = StageEvent::ItemRetry {
            item_id: "2".to_string(),
            attempt: 2,
            delay_ms: 1000,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "item_retry");
        assert_eq!(value["type"], event.kind());
        assert_eq!(value["delay_ms"], 1000);
        assert!(!event.is_terminal());

        let done = StageEvent::WorkflowAborted {
            reason: "x".to_string(),
        };
        assert_eq!(serde_json::to_value(&done).unwrap()["type"], done.kind());
        assert!(done.is_terminal());

        let mode = StageEvent::ModeSelected {
            mode: Mode::Chat,
            confidence: 0.9,
            reasoning: "greeting".to_string(),
        };
        let value = serde_json::to_value(&mode).unwrap();
        assert_eq!(value["type"], "mode_selected");
        assert_eq!(value["mode"], "chat");
    }
}
