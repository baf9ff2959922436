//! Unified error types for Triad

use thiserror::Error;

/// Unified error type for all Triad operations
#[derive(Error, Debug)]
pub enum TriadError {
    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake with '{server}' timed out after {timeout_ms}ms")]
    HandshakeTimeout { server: String, timeout_ms: u64 },

    #[error("Tool call '{tool}' timed out after {timeout_ms}ms")]
    ToolCallTimeout { tool: String, timeout_ms: u64 },

    // Resource errors
    #[error("No ready server provides tool: {0}")]
    ToolNotFound(String),

    #[error("Tool server not found: {0}")]
    ServerNotFound(String),

    #[error("Tool server '{0}' exited")]
    ProcessExited(String),

    #[error("Failed to spawn tool server '{server}': {message}")]
    Spawn { server: String, message: String },

    #[error("Tool error {code}: {message}")]
    ToolError { code: i64, message: String },

    // Verification errors
    #[error("Verification error: {0}")]
    Verification(String),

    #[error("Analysis capability failed: {0}")]
    AnalysisFailed(String),

    // Orchestration errors
    #[error("Item {item_id} exceeded {max_attempts} attempts")]
    MaxAttemptsExceeded { item_id: String, max_attempts: u32 },

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Invalid planning decision: {0}")]
    InvalidDecision(String),

    #[error("Session {0} already has a run in flight")]
    SessionBusy(String),

    // Resilience errors
    #[error("Circuit '{name}' is OPEN, retry in {retry_in_ms}ms")]
    CircuitOpen { name: String, retry_in_ms: u64 },

    #[error("Circuit '{0}' is HALF_OPEN and its probe budget is exhausted")]
    HalfOpenLimit(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    // Model backends
    #[error("LLM error: {0}")]
    Llm(String),

    // Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl TriadError {
    /// True for rejections produced by a circuit breaker rather than by the
    /// protected call itself.
    pub fn is_circuit_rejection(&self) -> bool {
        matches!(
            self,
            TriadError::CircuitOpen { .. } | TriadError::HalfOpenLimit(_) | TriadError::Timeout(_)
        )
    }

    /// Short machine-readable code for the error class
    pub fn code(&self) -> &'static str {
        match self {
            TriadError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            TriadError::HalfOpenLimit(_) => "HALF_OPEN_LIMIT",
            TriadError::Timeout(_) => "TIMEOUT",
            TriadError::HandshakeTimeout { .. } => "HANDSHAKE_TIMEOUT",
            TriadError::ToolCallTimeout { .. } => "TOOL_CALL_TIMEOUT",
            TriadError::ProcessExited(_) => "PROCESS_EXITED",
            TriadError::Transport(_) | TriadError::MalformedPayload(_) => "TRANSPORT",
            TriadError::Protocol(_) => "PROTOCOL",
            TriadError::AnalysisFailed(_) | TriadError::Verification(_) => "VERIFICATION",
            TriadError::Aborted(_) => "ABORTED",
            _ => "ERROR",
        }
    }
}

/// Result type alias using TriadError
pub type Result<T> = std::result::Result<T, TriadError>;
