//! # triad-agent
//!
//! Clients for the agent roles and the resilience wrapper around them.
//!
//! - `AgentTransport`: one streaming socket exchange per call with the
//!   executor agent runtime, with activity-based completion detection and
//!   tool-request arbitration against an allowlist
//! - `LlmClient`: stateless chat-completions calls for the planning roles
//! - `CircuitBreaker`: failure isolation for any async dependency
//!
//! ## Key Pattern
//!
//! The remote runtime never reliably says "done". An exchange ends on an
//! explicit `complete`, on inactivity, or on an absolute ceiling, whichever
//! comes first, and resolves with whatever text was collected.

mod allowlist;
mod circuit_breaker;
pub mod events;
mod llm;
pub mod reply;
mod transport;
mod types;

pub use allowlist::ToolAllowlist;
pub use circuit_breaker::{BreakerMetrics, CircuitBreaker, CircuitState};
pub use events::{InboundEvent, InboundFrame, OutboundMessage, ToolResponseFrame};
pub use llm::LlmClient;
pub use reply::{extract_json, strip_code_fence};
pub use transport::{truncate_prompt, ws_url, AgentTransport, ExchangeEnd};
pub use types::*;
