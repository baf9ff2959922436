//! Configuration management for Triad
//!
//! Settings for the circuit breakers, tool servers, the agent transport, the
//! LLM endpoint used by the planning roles, verification and sessions.
//! Loaded from `.triad/config.toml`; every field has a default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::Result;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriadConfig {
    /// Breaker wrapped around individual dependencies
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Breaker wrapped around whole orchestration runs
    #[serde(default = "default_pipeline_breaker")]
    pub pipeline_breaker: BreakerConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before probing
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Probes admitted (and successes required) in half-open state
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,

    /// Hard timeout for each protected call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

/// Tool server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_list_timeout_ms")]
    pub list_timeout_ms: u64,

    #[serde(default = "default_tool_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Wait between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Narrow the tool catalogue to the servers relevant to each item
    #[serde(default = "default_true")]
    pub select_servers: bool,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// One tool server subprocess
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Agent transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the agent runtime (http(s) or ws(s))
    #[serde(default = "default_agent_url")]
    pub url: String,

    /// Base name used to build per-exchange session ids
    #[serde(default = "default_session_base")]
    pub session_base: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_inactivity_ms")]
    pub max_inactivity_ms: u64,

    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,

    /// Exact tool names the remote agent may request
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,

    /// Name prefixes the remote agent may request
    #[serde(default = "default_allowed_prefixes")]
    pub allowed_prefixes: Vec<String>,

    /// Forward allowed tool requests to the tool servers instead of acking them
    #[serde(default)]
    pub dispatch_allowed_tools: bool,
}

/// OpenAI-compatible chat endpoint used by the planning roles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_llm_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Environment variable holding a bearer token, if the endpoint needs one
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// Verification gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Minimum confidence for a passing verification
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: u8,

    /// Below this confidence a failure is always adjusted
    #[serde(default = "default_low_confidence")]
    pub low_confidence: u8,

    /// Number of recent screenshots considered for stuck detection
    #[serde(default = "default_stuck_window")]
    pub stuck_window: usize,

    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: String,

    /// Capture command; `{path}` is replaced by the output file
    #[serde(default = "default_capture_command")]
    pub capture_command: Vec<String>,

    /// A capture command still running after this long is killed
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
}

/// Session and attempt settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Prior turns kept for prompt building
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Idle time after which a session is dropped
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Route conversational requests to a direct reply instead of a TODO list
    #[serde(default = "default_true")]
    pub select_mode: bool,
}

// Default value providers
fn default_true() -> bool {
    true
}

fn default_capture_timeout_ms() -> u64 {
    10_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    3
}

fn default_call_timeout_ms() -> u64 {
    60_000
}

fn default_pipeline_breaker() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 3,
        recovery_timeout_ms: 60_000,
        half_open_max_calls: 1,
        call_timeout_ms: 300_000,
    }
}

fn default_handshake_timeout_ms() -> u64 {
    15_000
}

fn default_list_timeout_ms() -> u64 {
    20_000
}

fn default_tool_call_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    3_000
}

fn default_agent_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_session_base() -> String {
    "triad".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_inactivity_ms() -> u64 {
    30_000
}

fn default_max_wait_ms() -> u64 {
    240_000
}

fn default_max_prompt_chars() -> usize {
    4_000
}

fn default_allowed_tools() -> Vec<String> {
    [
        "computercontroller__computer_control",
        "developer__list_windows",
        "developer__shell",
        "developer__open_url",
        "developer__list_processes",
        "playwright__browser_open",
        "playwright__browser_click",
        "playwright__browser_type",
        "playwright__browser_navigate",
        "playwright__browser_take_screenshot",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_allowed_prefixes() -> Vec<String> {
    vec![
        "browser_".to_string(),
        "playwright__".to_string(),
        "vscode__".to_string(),
    ]
}

fn default_llm_endpoint() -> String {
    "http://localhost:4000/v1/chat/completions".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_llm_max_tokens() -> u32 {
    2_000
}

fn default_llm_timeout_ms() -> u64 {
    60_000
}

fn default_confidence_threshold() -> u8 {
    70
}

fn default_low_confidence() -> u8 {
    50
}

fn default_stuck_window() -> usize {
    3
}

fn default_screenshot_dir() -> String {
    ".triad/screenshots".to_string()
}

fn default_capture_command() -> Vec<String> {
    if cfg!(target_os = "macos") {
        vec!["screencapture".to_string(), "-x".to_string(), "{path}".to_string()]
    } else {
        vec!["scrot".to_string(), "{path}".to_string()]
    }
}

fn default_history_limit() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_session_ttl_secs() -> u64 {
    1_800
}

impl TriadConfig {
    /// Load configuration from `.triad/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".triad/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::TriadError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Write default configuration to `.triad/config.toml`
    pub fn write_default(root: &Path) -> Result<()> {
        let config_dir = root.join(".triad");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let config = Self::default();
        let content = toml::to_string_pretty(&config).map_err(|e| {
            crate::TriadError::Config(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl AgentConfig {
    /// Never zero, so it can drive a `tokio::time::interval`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_inactivity(&self) -> Duration {
        Duration::from_millis(self.max_inactivity_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl VerifyConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }
}

impl Default for TriadConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            pipeline_breaker: default_pipeline_breaker(),
            tools: ToolsConfig::default(),
            agent: AgentConfig::default(),
            llm: LlmConfig::default(),
            verify: VerifyConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            list_timeout_ms: default_list_timeout_ms(),
            call_timeout_ms: default_tool_call_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            select_servers: true,
            servers: vec![],
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: default_agent_url(),
            session_base: default_session_base(),
            poll_interval_ms: default_poll_interval_ms(),
            max_inactivity_ms: default_max_inactivity_ms(),
            max_wait_ms: default_max_wait_ms(),
            max_prompt_chars: default_max_prompt_chars(),
            allowed_tools: default_allowed_tools(),
            allowed_prefixes: default_allowed_prefixes(),
            dispatch_allowed_tools: false,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_llm_max_tokens(),
            request_timeout_ms: default_llm_timeout_ms(),
            api_key_env: None,
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            low_confidence: default_low_confidence(),
            stuck_window: default_stuck_window(),
            screenshot_dir: default_screenshot_dir(),
            capture_command: default_capture_command(),
            capture_timeout_ms: default_capture_timeout_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            session_ttl_secs: default_session_ttl_secs(),
            select_mode: true,
        }
    }
}
