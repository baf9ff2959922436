//! # triad-orchestrator
//!
//! The plan, execute, verify and replan pipeline for Triad.
//!
//! This crate provides:
//! - [`Orchestrator`], which streams [`StageEvent`]s for one request per session
//! - Role seams ([`TodoPlanner`], [`ToolPlanner`], [`ItemExecutor`],
//!   [`ItemVerifier`], [`Replanner`]) with LLM and tool backed implementations
//! - Optional routing: chat/task [`ModeSelector`] ahead of planning and a
//!   per-item [`ServerSelector`] that narrows the tool catalogue
//! - [`PlanningDecision`] validation for replanner output
//! - A pure stage machine that checks the order of emitted events
//! - Per-session history with prompt-injection sanitizing

mod decision;
mod events;
mod executor;
mod orchestrator;
mod planner;
mod prompt;
mod roles;
mod session;
mod state_machine;

pub use decision::{item_from_value, PlanningDecision};
pub use events::StageEvent;
pub use executor::ToolExecutor;
pub use orchestrator::Orchestrator;
pub use planner::{
    LlmChatResponder, LlmModeSelector, LlmReplanner, LlmServerSelector, LlmTodoPlanner,
    LlmToolPlanner,
};
pub use prompt::{
    build_chat_prompt, build_mode_prompt, build_replan_prompt, build_server_selection_prompt,
    build_todo_prompt, build_tool_plan_prompt, parse_mode_selection, parse_server_selection,
    parse_todo_items, parse_tool_calls, MAX_SELECTED_SERVERS,
};
pub use roles::{
    ChatResponder, ItemExecutor, ItemVerifier, Mode, ModeSelection, ModeSelector,
    PlannedToolCall, ReplanContext, Replanner, ServerSelector, ServerSummary, TodoPlanner,
    ToolPlanner,
};
pub use session::{sanitize, Session, SessionRegistry, Turn};
pub use state_machine::{transition, Stage, StageAction};
