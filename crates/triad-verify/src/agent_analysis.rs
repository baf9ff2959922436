//! Analysis performed by the verifier agent over the agent transport

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use triad_agent::{extract_json, AgentTransport};
use triad_core::{Result, TriadError};

use crate::analysis::{Analysis, StuckAnalysis, StuckAssessment, VisionAnalysis};

/// Session base used for verifier exchanges
pub const VERIFIER_SESSION: &str = "triad_verifier";

pub struct AgentVisionAnalysis {
    transport: Arc<AgentTransport>,
    session_base: String,
}

impl AgentVisionAnalysis {
    pub fn new(transport: Arc<AgentTransport>) -> Self {
        Self {
            transport,
            session_base: VERIFIER_SESSION.to_string(),
        }
    }

    pub fn with_session_base(mut self, base: impl Into<String>) -> Self {
        self.session_base = base.into();
        self
    }

    async fn ask(&self, prompt: &str) -> Result<Value> {
        let reply = self
            .transport
            .exchange_in(&self.session_base, prompt)
            .await?
            .ok_or_else(|| TriadError::AnalysisFailed("verifier agent gave no reply".to_string()))?;
        debug!(chars = reply.len(), "Verifier reply received");
        extract_json(&reply)
            .map_err(|e| TriadError::AnalysisFailed(format!("unparseable verifier reply: {}", e)))
    }
}

#[async_trait]
impl VisionAnalysis for AgentVisionAnalysis {
    async fn analyze_screenshot(
        &self,
        path: &str,
        criteria: &str,
        context: &str,
    ) -> Result<Analysis> {
        let value = self.ask(&analysis_prompt(path, criteria, context)).await?;
        Analysis::from_value(&value).map_err(|e| TriadError::AnalysisFailed(e.to_string()))
    }
}

#[async_trait]
impl StuckAnalysis for AgentVisionAnalysis {
    async fn detect_stuck_state(
        &self,
        paths: &[String],
        expected_activity: &str,
    ) -> Result<StuckAssessment> {
        let value = self.ask(&stuck_prompt(paths, expected_activity)).await?;
        serde_json::from_value(value)
            .map_err(|e| TriadError::AnalysisFailed(format!("bad stuck assessment: {}", e)))
    }
}

pub fn analysis_prompt(path: &str, criteria: &str, context: &str) -> String {
    let mut prompt = format!(
        "You are verifying a task step from independent visual evidence.\n\n\
         Screenshot: {}\n\
         Success criteria: {}\n",
        path, criteria
    );
    if !context.is_empty() {
        prompt.push_str(&format!("Context:\n{}\n", context));
    }
    prompt.push_str(
        "\nOpen the screenshot and judge only what it shows. Reply with ONLY a JSON object:\n\
         {\"verified\": bool, \"confidence\": 0-100, \"reason\": \"...\", \
         \"failure_cause\": \"timing_issue|wrong_approach|tool_execution_failed|wrong_parameters|\
         unrealistic_criteria|unclear_state|unknown\", \
         \"visual_evidence\": {\"observed\": \"...\", \"matches_criteria\": bool, \"details\": \"...\"}}",
    );
    prompt
}

pub fn stuck_prompt(paths: &[String], expected_activity: &str) -> String {
    let list = paths
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{}. {}", i + 1, p))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "These screenshots were taken in order:\n{}\n\n\
         Expected activity: {}\n\n\
         Is the system stuck (no visible progress)? Reply with ONLY a JSON object:\n\
         {{\"stuck\": bool, \"confidence\": 0-100, \"reason\": \"...\"}}",
        list, expected_activity
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_prompt_mentions_inputs() {
        let prompt = analysis_prompt("/tmp/a.png", "Calculator shows 4", "action: type 2+2");
        assert!(prompt.contains("/tmp/a.png"));
        assert!(prompt.contains("Calculator shows 4"));
        assert!(prompt.contains("action: type 2+2"));
        assert!(prompt.contains("\"failure_cause\""));

        let bare = analysis_prompt("/tmp/a.png", "x", "");
        assert!(!bare.contains("Context:"));
    }

    #[test]
    fn test_stuck_prompt_numbers_paths() {
        let prompt = stuck_prompt(&["a.png".to_string(), "b.png".to_string()], "download");
        assert!(prompt.contains("1. a.png\n2. b.png"));
        assert!(prompt.contains("{\"stuck\": bool"));
    }

    #[test]
    fn test_verifier_reply_parses_into_analysis() {
        let reply = "Here is my verdict:\n```json\n{\"verified\": false, \"confidence\": 35, \
                     \"reason\": \"dialog still loading\", \"failure_cause\": \"timing_issue\"}\n```";
        let analysis = Analysis::from_value(&extract_json(reply).unwrap()).unwrap();
        assert!(!analysis.verified);
        assert_eq!(analysis.confidence, 35);
        assert_eq!(
            analysis.failure_cause,
            Some(triad_core::FailureCause::TimingIssue)
        );
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_analysis_error() {
        let config = triad_core::config::AgentConfig {
            url: "http://127.0.0.1:9".to_string(),
            max_inactivity_ms: 500,
            ..Default::default()
        };
        let analysis = AgentVisionAnalysis::new(Arc::new(AgentTransport::new(config)));
        assert!(analysis
            .analyze_screenshot("/tmp/a.png", "x", "")
            .await
            .is_err());
    }
}
