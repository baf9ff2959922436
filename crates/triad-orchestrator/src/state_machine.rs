//! Pure stage machine for one run
//!
//! No I/O. The orchestrator feeds every event it emits through
//! `transition`, so an out-of-order event shows up as `Stage::Failed`
//! instead of silently corrupting the run.
//!
//! - Pure function: transition(stage, event) -> (stage, actions)
//! - Invalid transitions go to Failed (never panic)

use crate::events::StageEvent;
use crate::roles::Mode;

/// Where a run currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Idle,
    /// Answering a chat-mode request directly
    Chatting,
    Planning { request: String },
    /// Between items
    Ready,
    Executing { item_id: String, attempt: u32 },
    Verifying { item_id: String },
    Adjusting { item_id: String },
    Complete,
    Aborted { reason: String },
    Failed { error: String },
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Aborted { .. } | Self::Failed { .. }
        )
    }
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageAction {
    LogActivity { message: String },
    ExecuteItem { item_id: String },
    VerifyItem { item_id: String },
    RequestDecision { item_id: String },
    ScheduleRetry { item_id: String, delay_ms: u64 },
}

fn log(message: String) -> StageAction {
    StageAction::LogActivity { message }
}

/// Pure transition function
pub fn transition(stage: Stage, event: &StageEvent) -> (Stage, Vec<StageAction>) {
    use StageEvent as E;

    match (stage, event) {
        (Stage::Idle, E::ModeSelected { mode, confidence, .. }) => {
            let next = match mode {
                Mode::Chat => Stage::Chatting,
                Mode::Task => Stage::Idle,
            };
            (next, vec![log(format!("Mode {} ({:.2})", mode, confidence))])
        }

        (Stage::Chatting, E::ChatReplied { content }) => (
            Stage::Chatting,
            vec![log(format!("Replied with {} chars", content.len()))],
        ),

        (Stage::Chatting, E::WorkflowComplete { .. }) => {
            (Stage::Complete, vec![log("Chat complete".to_string())])
        }

        (Stage::Idle, E::PlanningStarted { request, .. }) => (
            Stage::Planning {
                request: request.clone(),
            },
            vec![log(format!("Planning: {}", request))],
        ),

        (Stage::Planning { .. }, E::TodoCreated { items, .. }) => (
            Stage::Ready,
            vec![log(format!("Planned {} items", items.len()))],
        ),

        (Stage::Ready, E::ItemStarted { item_id, attempt, .. }) => (
            Stage::Executing {
                item_id: item_id.clone(),
                attempt: *attempt,
            },
            vec![StageAction::ExecuteItem {
                item_id: item_id.clone(),
            }],
        ),

        (Stage::Executing { item_id, .. }, E::ItemExecuted { result })
            if result.item_id == item_id =>
        {
            (
                Stage::Verifying {
                    item_id: item_id.clone(),
                },
                vec![StageAction::VerifyItem { item_id }],
            )
        }

        (Stage::Verifying { item_id }, E::ItemVerified { result })
            if result.item_id == item_id =>
        {
            if result.verified {
                (
                    Stage::Ready,
                    vec![log(format!("Item {} verified", item_id))],
                )
            } else {
                (
                    Stage::Adjusting {
                        item_id: item_id.clone(),
                    },
                    vec![StageAction::RequestDecision { item_id }],
                )
            }
        }

        (Stage::Adjusting { item_id }, E::ItemRetry { delay_ms, .. }) => (
            Stage::Ready,
            vec![StageAction::ScheduleRetry {
                item_id,
                delay_ms: *delay_ms,
            }],
        ),

        (Stage::Adjusting { item_id }, E::ItemAdjusted { strategy, .. }) => (
            Stage::Adjusting {
                item_id: item_id.clone(),
            },
            vec![log(format!("Item {} adjusted: {}", item_id, strategy))],
        ),

        (Stage::Adjusting { .. }, E::Replanned { inserted, .. }) => (
            Stage::Ready,
            vec![log(format!("Inserted {} items", inserted.len()))],
        ),

        (Stage::Adjusting { .. }, E::ItemSkipped { item_id, reason })
        | (Stage::Ready, E::ItemSkipped { item_id, reason }) => (
            Stage::Ready,
            vec![log(format!("Item {} skipped: {}", item_id, reason))],
        ),

        (Stage::Adjusting { .. }, E::ItemFailed { item_id, reason })
        | (Stage::Executing { .. }, E::ItemFailed { item_id, reason }) => (
            Stage::Ready,
            vec![log(format!("Item {} failed: {}", item_id, reason))],
        ),

        (Stage::Ready, E::WorkflowComplete { summary })
        | (Stage::Planning { .. }, E::WorkflowComplete { summary }) => (
            Stage::Complete,
            vec![log(format!(
                "Complete: {}/{} items",
                summary.completed, summary.total
            ))],
        ),

        // Abort is accepted from every non-terminal stage
        (stage, E::WorkflowAborted { reason }) if !stage.is_terminal() => (
            Stage::Aborted {
                reason: reason.clone(),
            },
            vec![log(format!("Aborted: {}", reason))],
        ),

        (stage, event) => (
            Stage::Failed {
                error: format!(
                    "Invalid stage transition: {:?} cannot handle {}",
                    stage,
                    event.kind()
                ),
            },
            vec![],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triad_core::{ExecutionResult, TodoItem, TodoSummary, VerificationResult};

    fn verified(item_id: &str, ok: bool) -> StageEvent {
        let mut result = VerificationResult::analysis_failure(item_id, "x");
        result.verified = ok;
        StageEvent::ItemVerified { result }
    }

    fn run(events: &[StageEvent]) -> Stage {
        events
            .iter()
            .fold(Stage::Idle, |stage, event| transition(stage, event).0)
    }

    #[test]
    fn test_happy_path() {
        let events = vec![
            StageEvent::PlanningStarted {
                session_id: "s".to_string(),
                request: "add 2+2".to_string(),
            },
            StageEvent::TodoCreated {
                list_id: "l".to_string(),
                items: vec![TodoItem::new("a").with_id("1")],
            },
            StageEvent::ItemStarted {
                item_id: "1".to_string(),
                action: "a".to_string(),
                attempt: 1,
            },
            StageEvent::ItemExecuted {
                result: ExecutionResult::from_runs("1", 1, vec![]),
            },
            verified("1", true),
            StageEvent::WorkflowComplete {
                summary: TodoSummary::default(),
            },
        ];
        assert_eq!(run(&events), Stage::Complete);
    }

    #[test]
    fn test_mode_selection_routes() {
        let chat = vec![
            StageEvent::ModeSelected {
                mode: Mode::Chat,
                confidence: 0.9,
                reasoning: String::new(),
            },
            StageEvent::ChatReplied {
                content: "hello".to_string(),
            },
            StageEvent::WorkflowComplete {
                summary: TodoSummary::default(),
            },
        ];
        assert_eq!(run(&chat), Stage::Complete);

        let task = vec![
            StageEvent::ModeSelected {
                mode: Mode::Task,
                confidence: 0.8,
                reasoning: String::new(),
            },
            StageEvent::PlanningStarted {
                session_id: "s".to_string(),
                request: "r".to_string(),
            },
        ];
        assert!(matches!(run(&task), Stage::Planning { .. }));

        let (stage, _) = transition(
            Stage::Chatting,
            &StageEvent::PlanningStarted {
                session_id: "s".to_string(),
                request: "r".to_string(),
            },
        );
        assert!(matches!(stage, Stage::Failed { .. }));
    }

    #[test]
    fn test_failed_verification_goes_to_adjusting() {
        let (stage, actions) = transition(
            Stage::Verifying {
                item_id: "1".to_string(),
            },
            &verified("1", false),
        );
        assert_eq!(
            stage,
            Stage::Adjusting {
                item_id: "1".to_string()
            }
        );
        assert_eq!(
            actions,
            vec![StageAction::RequestDecision {
                item_id: "1".to_string()
            }]
        );

        let (stage, actions) = transition(
            stage,
            &StageEvent::ItemRetry {
                item_id: "1".to_string(),
                attempt: 2,
                delay_ms: 1000,
            },
        );
        assert!(matches!(stage, Stage::Ready));
        assert!(matches!(
            actions[0],
            StageAction::ScheduleRetry { delay_ms: 1000, .. }
        ));
    }

    #[test]
    fn test_result_for_wrong_item_fails() {
        let (stage, _) = transition(
            Stage::Verifying {
                item_id: "1".to_string(),
            },
            &verified("2", true),
        );
        assert!(matches!(stage, Stage::Failed { .. }));
    }

    #[test]
    fn test_abort_from_any_live_stage() {
        let abort = StageEvent::WorkflowAborted {
            reason: "circuit open".to_string(),
        };
        for stage in [
            Stage::Idle,
            Stage::Planning {
                request: "r".to_string(),
            },
            Stage::Ready,
            Stage::Chatting,
            Stage::Adjusting {
                item_id: "1".to_string(),
            },
        ] {
            assert!(matches!(transition(stage, &abort).0, Stage::Aborted { .. }));
        }
    }

    #[test]
    fn test_terminal_stages_reject_everything() {
        let abort = StageEvent::WorkflowAborted {
            reason: "again".to_string(),
        };
        assert!(matches!(
            transition(Stage::Complete, &abort).0,
            Stage::Failed { .. }
        ));
        assert!(matches!(
            transition(
                Stage::Aborted {
                    reason: "first".to_string()
                },
                &abort
            )
            .0,
            Stage::Failed { .. }
        ));
    }

    #[test]
    fn test_invalid_transition_never_panics() {
        let (stage, actions) = transition(
            Stage::Idle,
            &StageEvent::ItemExecuted {
                result: ExecutionResult::from_runs("1", 1, vec![]),
            },
        );
        assert!(matches!(stage, Stage::Failed { .. }));
        assert!(actions.is_empty());
    }
}
