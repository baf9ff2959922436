//! # triad-tools
//!
//! Tool servers for Triad: subprocesses that speak line-delimited JSON-RPC
//! 2.0 on stdin/stdout.
//!
//! Each server is started, handshaken (`initialize`, then
//! `notifications/initialized`, then `tools/list`) and kept in a registry
//! that routes a tool name to the first ready server advertising it.
//! Requests are matched to responses by id, so out-of-order replies are fine.
//! A server that exits fails all of its outstanding requests at once.

pub mod protocol;
mod manager;
mod server;

pub use manager::ToolManager;
pub use protocol::ToolCallOutcome;
pub use server::{ServerStatus, ToolServer};
