//! Core type definitions for Triad pipeline stages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a TODO item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Executing,
    Verifying,
    Completed,
    Failed,
    Skipped,
}

impl ItemStatus {
    /// Whether the item reached a final status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Executing => write!(f, "executing"),
            Self::Verifying => write!(f, "verifying"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "verifying" => Ok(Self::Verifying),
            "completed" | "done" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid item status: {}", s)),
        }
    }
}

/// Why a verification failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    TimingIssue,
    WrongApproach,
    ToolExecutionFailed,
    WrongParameters,
    UnrealisticCriteria,
    UnclearState,
    #[default]
    Unknown,
}

impl FailureCause {
    /// The recovery strategy recommended for this cause
    pub fn strategy(&self) -> RecoveryStrategy {
        match self {
            Self::TimingIssue => RecoveryStrategy::RetryWithDelays,
            Self::WrongApproach => RecoveryStrategy::ReplanWithDifferentTools,
            Self::ToolExecutionFailed => RecoveryStrategy::FixToolParameters,
            Self::WrongParameters => RecoveryStrategy::ModifyParameters,
            Self::UnrealisticCriteria => RecoveryStrategy::AdjustSuccessCriteria,
            Self::UnclearState => RecoveryStrategy::SplitIntoSmallerItems,
            Self::Unknown => RecoveryStrategy::ModifyOrSplit,
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimingIssue => write!(f, "timing_issue"),
            Self::WrongApproach => write!(f, "wrong_approach"),
            Self::ToolExecutionFailed => write!(f, "tool_execution_failed"),
            Self::WrongParameters => write!(f, "wrong_parameters"),
            Self::UnrealisticCriteria => write!(f, "unrealistic_criteria"),
            Self::UnclearState => write!(f, "unclear_state"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for FailureCause {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "timing_issue" | "timing" => Ok(Self::TimingIssue),
            "wrong_approach" => Ok(Self::WrongApproach),
            "tool_execution_failed" | "tool_failed" => Ok(Self::ToolExecutionFailed),
            "wrong_parameters" => Ok(Self::WrongParameters),
            "unrealistic_criteria" => Ok(Self::UnrealisticCriteria),
            "unclear_state" => Ok(Self::UnclearState),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid failure cause: {}", s)),
        }
    }
}

/// Recovery strategy recommended by the verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryWithDelays,
    ReplanWithDifferentTools,
    FixToolParameters,
    ModifyParameters,
    AdjustSuccessCriteria,
    SplitIntoSmallerItems,
    ModifyOrSplit,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetryWithDelays => write!(f, "retry_with_delays"),
            Self::ReplanWithDifferentTools => write!(f, "replan_with_different_tools"),
            Self::FixToolParameters => write!(f, "fix_tool_parameters"),
            Self::ModifyParameters => write!(f, "modify_parameters"),
            Self::AdjustSuccessCriteria => write!(f, "adjust_success_criteria"),
            Self::SplitIntoSmallerItems => write!(f, "split_into_smaller_items"),
            Self::ModifyOrSplit => write!(f, "modify_or_split"),
        }
    }
}

/// What the orchestrator should do after a verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Continue,
    Retry,
    Adjust,
}

impl std::fmt::Display for NextAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Retry => write!(f, "retry"),
            Self::Adjust => write!(f, "adjust"),
        }
    }
}

/// One tool invocation made while executing an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRun {
    pub tool: String,
    pub server: Option<String>,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolRun {
    pub fn succeeded(tool: impl Into<String>, output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            tool: tool.into(),
            server: None,
            success: true,
            output: Some(output),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(tool: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            tool: tool.into(),
            server: None,
            success: false,
            output: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }
}

/// Record of one execute stage, consumed by the verify stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub item_id: String,
    pub attempt: u32,
    pub runs: Vec<ToolRun>,
    pub summary: String,
}

impl ExecutionResult {
    /// Build a result and derive the summary from the runs
    pub fn from_runs(item_id: impl Into<String>, attempt: u32, runs: Vec<ToolRun>) -> Self {
        let ok = runs.iter().filter(|r| r.success).count();
        let mut summary = format!("{}/{} tools succeeded", ok, runs.len());
        for run in runs.iter().filter(|r| !r.success) {
            summary.push_str(&format!(
                "; {} failed: {}",
                run.tool,
                run.error.as_deref().unwrap_or("unknown error")
            ));
        }
        Self {
            item_id: item_id.into(),
            attempt,
            runs,
            summary,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.runs.iter().all(|r| r.success)
    }

    pub fn tools_used(&self) -> Vec<&str> {
        self.runs.iter().map(|r| r.tool.as_str()).collect()
    }
}

/// What the analysis capability observed in a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualEvidence {
    #[serde(default)]
    pub observed: String,
    #[serde(default)]
    pub matches_criteria: bool,
    #[serde(default)]
    pub details: String,
}

/// Metadata of a captured screenshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    pub filepath: String,
    pub filename: String,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
    pub hash: String,
    pub context: String,
    pub changed: bool,
}

/// Lowest confidence a passing verification may carry, whatever the config says
pub const MIN_VERIFIED_CONFIDENCE: u8 = 70;

/// Outcome of the verify stage
///
/// `verified == true` always implies `confidence >= MIN_VERIFIED_CONFIDENCE`; the
/// gate is the only producer of passing results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub item_id: String,
    pub verified: bool,
    /// 0-100
    pub confidence: u8,
    pub reason: String,
    pub visual_evidence: Option<VisualEvidence>,
    pub failure_cause: Option<FailureCause>,
    pub recommended_strategy: Option<RecoveryStrategy>,
    pub next_action: NextAction,
    pub screenshot: Option<Screenshot>,
    /// Set when the analysis capability itself failed
    pub analysis_error: Option<String>,
}

impl VerificationResult {
    /// A failed verification caused by the verification path itself
    pub fn analysis_failure(item_id: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            item_id: item_id.into(),
            verified: false,
            confidence: 0,
            reason: format!("Verification could not be performed: {}", error),
            visual_evidence: None,
            failure_cause: Some(FailureCause::UnclearState),
            recommended_strategy: Some(FailureCause::UnclearState.strategy()),
            next_action: NextAction::Adjust,
            screenshot: None,
            analysis_error: Some(error),
        }
    }
}

/// A tool advertised by a tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_cause_strategy_mapping() {
        assert_eq!(
            FailureCause::TimingIssue.strategy(),
            RecoveryStrategy::RetryWithDelays
        );
        assert_eq!(
            FailureCause::WrongApproach.strategy(),
            RecoveryStrategy::ReplanWithDifferentTools
        );
        assert_eq!(
            FailureCause::ToolExecutionFailed.strategy(),
            RecoveryStrategy::FixToolParameters
        );
        assert_eq!(
            FailureCause::WrongParameters.strategy(),
            RecoveryStrategy::ModifyParameters
        );
        assert_eq!(
            FailureCause::UnrealisticCriteria.strategy(),
            RecoveryStrategy::AdjustSuccessCriteria
        );
        assert_eq!(
            FailureCause::UnclearState.strategy(),
            RecoveryStrategy::SplitIntoSmallerItems
        );
        assert_eq!(FailureCause::Unknown.strategy(), RecoveryStrategy::ModifyOrSplit);
    }

    #[test]
    fn test_failure_cause_parse() {
        assert_eq!(
            "wrong-parameters".parse::<FailureCause>().unwrap(),
            FailureCause::WrongParameters
        );
        assert!("nonsense".parse::<FailureCause>().is_err());
        let json = serde_json::to_string(&FailureCause::TimingIssue).unwrap();
        assert_eq!(json, "\"timing_issue\"");
    }

    #[test]
    fn test_execution_summary() {
        let result = ExecutionResult::from_runs(
            "1",
            1,
            vec![
                ToolRun::succeeded("shell", serde_json::json!({"ok": true}), 5),
                ToolRun::failed("click", "element missing", 3),
            ],
        );
        assert!(!result.all_succeeded());
        assert_eq!(result.tools_used(), vec!["shell", "click"]);
        assert!(result.summary.starts_with("1/2 tools succeeded"));
        assert!(result.summary.contains("click failed: element missing"));
    }

    #[test]
    fn test_analysis_failure_is_not_verified() {
        let result = VerificationResult::analysis_failure("3", "vision backend down");
        assert!(!result.verified);
        assert_eq!(result.next_action, NextAction::Adjust);
        assert_eq!(result.analysis_error.as_deref(), Some("vision backend down"));
    }
}
