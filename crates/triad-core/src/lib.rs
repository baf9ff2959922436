//! # triad-core
//!
//! Core types for the Triad agent pipeline.
//!
//! Triad coordinates three agent roles (a planner, an executor and a verifier)
//! over a list of TODO items. Tools run in subprocess servers, the executor
//! agent is reached over a streaming socket, and every item is checked against
//! independent evidence before the pipeline moves on.
//!
//! ## Core Paradigm
//!
//! - Work IS a TODO list (each item carries its own success criterion)
//! - Success IS verified evidence (never the executor's self-report)
//! - Failure IS classified (a cause picks the recovery strategy)
//! - Replanning IS a closed decision (continue, replan, skip or abort)

pub mod config;
mod dispatch;
mod error;
pub mod fail_open;
mod todo;
mod types;

pub use config::TriadConfig;
pub use dispatch::ToolDispatcher;
pub use error::{Result, TriadError};
pub use todo::{TodoItem, TodoList, TodoSummary};
pub use types::*;
