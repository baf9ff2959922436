//! The verification gate
//!
//! A verification never passes on the executor's word. The gate captures a
//! fresh snapshot, has it judged against the item's success criteria, and
//! only passes the item when the judge is both positive and confident.

use std::sync::Arc;
use tracing::{info, instrument, warn};
use triad_core::config::VerifyConfig;
use triad_core::{
    ExecutionResult, NextAction, TodoItem, VerificationResult, MIN_VERIFIED_CONFIDENCE,
};

use crate::analysis::VisionAnalysis;
use crate::capture::VisualCapture;
use crate::classify::{classify_failure, decide_next_action, Outcome};
use crate::stuck::StuckDetector;

pub struct VerificationGate {
    capture: Arc<dyn VisualCapture>,
    analysis: Arc<dyn VisionAnalysis>,
    stuck: Option<StuckDetector>,
    confidence_threshold: u8,
    low_confidence: u8,
}

impl VerificationGate {
    pub fn new(
        capture: Arc<dyn VisualCapture>,
        analysis: Arc<dyn VisionAnalysis>,
        config: &VerifyConfig,
    ) -> Self {
        Self {
            capture,
            analysis,
            stuck: None,
            confidence_threshold: config.confidence_threshold.max(MIN_VERIFIED_CONFIDENCE),
            low_confidence: config.low_confidence,
        }
    }

    /// Track snapshots per item and stop retrying items whose screen is frozen
    pub fn with_stuck_detector(mut self, detector: StuckDetector) -> Self {
        self.stuck = Some(detector);
        self
    }

    /// Effective threshold; a configured value below the floor is raised to it
    pub fn confidence_threshold(&self) -> u8 {
        self.confidence_threshold
    }

    /// Drop snapshot history kept for an item that will not be retried
    pub fn forget(&self, item_id: &str) {
        if let Some(stuck) = &self.stuck {
            stuck.forget(item_id);
        }
    }

    /// Verify one execution of `item`
    ///
    /// Failures of the capture or analysis path come back as a failed
    /// verification with `analysis_error` set, never as a pass.
    #[instrument(skip_all, fields(item_id = %item.id, attempt = item.attempt))]
    pub async fn verify(&self, item: &TodoItem, execution: &ExecutionResult) -> VerificationResult {
        let screenshot = match self.capture.capture(&item.id).await {
            Ok(screenshot) => screenshot,
            Err(e) => {
                warn!("Screenshot capture failed: {}", e);
                return VerificationResult::analysis_failure(&item.id, e.to_string());
            }
        };
        if let Some(stuck) = &self.stuck {
            stuck.record(&item.id, screenshot.filepath.clone());
        }

        let context = format!(
            "action: {}\nexecution: {}",
            item.action, execution.summary
        );
        let analysis = match self
            .analysis
            .analyze_screenshot(&screenshot.filepath, &item.success_criteria, &context)
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("Screenshot analysis failed: {}", e);
                let mut result = VerificationResult::analysis_failure(&item.id, e.to_string());
                result.screenshot = Some(screenshot);
                return result;
            }
        };

        let confidence = analysis.confidence.clamp(0, 100) as u8;
        let verified = analysis.verified && confidence >= self.confidence_threshold;
        let mut reason = analysis.reason.clone();
        if analysis.verified && !verified {
            reason = format!(
                "{} (confidence {} below threshold {})",
                reason, confidence, self.confidence_threshold
            )
            .trim_start()
            .to_string();
        }

        let failure_cause = if verified {
            None
        } else {
            Some(
                analysis
                    .failure_cause
                    .unwrap_or_else(|| classify_failure(&reason)),
            )
        };

        let mut next_action = decide_next_action(
            Outcome {
                verified,
                confidence,
                reason: &reason,
                attempt: item.attempt,
                max_attempts: item.max_attempts,
            },
            self.low_confidence,
        );

        if let Some(stuck) = &self.stuck {
            if verified {
                stuck.forget(&item.id);
            } else if next_action == NextAction::Retry {
                let assessment = stuck.check(&item.id, &item.success_criteria).await;
                if assessment.stuck {
                    next_action = NextAction::Adjust;
                    reason = format!("{}; stuck: {}", reason, assessment.reason);
                }
            }
        }

        info!(
            verified,
            confidence,
            next_action = %next_action,
            "Verification finished"
        );

        VerificationResult {
            item_id: item.id.clone(),
            verified,
            confidence,
            reason,
            visual_evidence: analysis.visual_evidence,
            failure_cause,
            recommended_strategy: failure_cause.map(|cause| cause.strategy()),
            next_action,
            screenshot: Some(screenshot),
            analysis_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Analysis, StuckAnalysis, StuckAssessment};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use triad_core::{FailureCause, RecoveryStrategy, Result, Screenshot, TriadError};

    struct MockCapture {
        fail: bool,
    }

    #[async_trait]
    impl VisualCapture for MockCapture {
        async fn capture(&self, context: &str) -> Result<Screenshot> {
            if self.fail {
                return Err(TriadError::AnalysisFailed("no display".to_string()));
            }
            Ok(Screenshot {
                filepath: format!("/tmp/{}.png", context),
                filename: format!("{}.png", context),
                timestamp: Utc::now(),
                size: 10,
                hash: "abc".to_string(),
                context: context.to_string(),
                changed: true,
            })
        }
    }

    /// Replays queued verdicts and records the criteria it was asked about
    struct MockAnalysis {
        verdicts: Mutex<Vec<Result<Analysis>>>,
        asked: Mutex<Vec<String>>,
    }

    impl MockAnalysis {
        fn new(verdicts: Vec<Result<Analysis>>) -> Self {
            Self {
                verdicts: Mutex::new(verdicts),
                asked: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VisionAnalysis for MockAnalysis {
        async fn analyze_screenshot(
            &self,
            _path: &str,
            criteria: &str,
            _context: &str,
        ) -> Result<Analysis> {
            self.asked.lock().unwrap().push(criteria.to_string());
            self.verdicts.lock().unwrap().remove(0)
        }
    }

    struct Frozen;

    #[async_trait]
    impl StuckAnalysis for Frozen {
        async fn detect_stuck_state(&self, _: &[String], _: &str) -> Result<StuckAssessment> {
            Ok(StuckAssessment {
                stuck: true,
                confidence: 80,
                reason: "same frame".to_string(),
            })
        }
    }

    fn verdict(verified: bool, confidence: i64, reason: &str) -> Result<Analysis> {
        Ok(Analysis {
            verified,
            confidence,
            reason: reason.to_string(),
            visual_evidence: None,
            failure_cause: None,
        })
    }

    fn gate(verdicts: Vec<Result<Analysis>>) -> VerificationGate {
        VerificationGate::new(
            Arc::new(MockCapture { fail: false }),
            Arc::new(MockAnalysis::new(verdicts)),
            &VerifyConfig::default(),
        )
    }

    fn item(attempt: u32) -> TodoItem {
        let mut item = TodoItem::new("Type 2+2")
            .with_id("1")
            .with_success_criteria("Calculator shows 4");
        item.attempt = attempt;
        item
    }

    fn execution() -> ExecutionResult {
        ExecutionResult::from_runs("1", 1, vec![])
    }

    #[tokio::test]
    async fn test_confident_pass_continues() {
        let result = gate(vec![verdict(true, 92, "Display shows 4")])
            .verify(&item(1), &execution())
            .await;
        assert!(result.verified);
        assert_eq!(result.confidence, 92);
        assert_eq!(result.next_action, NextAction::Continue);
        assert_eq!(result.failure_cause, None);
        assert_eq!(result.recommended_strategy, None);
        assert_eq!(result.screenshot.unwrap().filepath, "/tmp/1.png");
    }

    #[tokio::test]
    async fn test_low_confidence_pass_is_rejected() {
        let result = gate(vec![verdict(true, 69, "Probably 4")])
            .verify(&item(1), &execution())
            .await;
        assert!(!result.verified);
        assert_eq!(result.confidence, 69);
        assert!(result.reason.contains("below threshold 70"));
        assert_eq!(result.next_action, NextAction::Adjust);

        let edge = gate(vec![verdict(true, 70, "4")])
            .verify(&item(1), &execution())
            .await;
        assert!(edge.verified);
    }

    #[tokio::test]
    async fn test_lowered_threshold_keeps_floor() {
        let config = VerifyConfig {
            confidence_threshold: 50,
            ..VerifyConfig::default()
        };
        let gate = VerificationGate::new(
            Arc::new(MockCapture { fail: false }),
            Arc::new(MockAnalysis::new(vec![
                verdict(true, 55, "Display shows 4"),
                verdict(true, 70, "Display shows 4"),
            ])),
            &config,
        );
        assert_eq!(gate.confidence_threshold(), MIN_VERIFIED_CONFIDENCE);

        let weak = gate.verify(&item(1), &execution()).await;
        assert!(!weak.verified);
        assert_eq!(weak.confidence, 55);
        assert!(weak.reason.contains("below threshold 70"));

        let strong = gate.verify(&item(1), &execution()).await;
        assert!(strong.verified);
        assert!(strong.confidence >= MIN_VERIFIED_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_confidence_is_clamped() {
        let high = gate(vec![verdict(true, 250, "sure")])
            .verify(&item(1), &execution())
            .await;
        assert_eq!(high.confidence, 100);

        let low = gate(vec![verdict(false, -5, "blank")])
            .verify(&item(1), &execution())
            .await;
        assert_eq!(low.confidence, 0);
    }

    #[tokio::test]
    async fn test_structured_cause_wins_over_keywords() {
        let mut analysis = verdict(false, 60, "button not found").unwrap();
        analysis.failure_cause = Some(FailureCause::WrongParameters);
        let result = gate(vec![Ok(analysis)]).verify(&item(1), &execution()).await;
        assert_eq!(result.failure_cause, Some(FailureCause::WrongParameters));
        assert_eq!(
            result.recommended_strategy,
            Some(RecoveryStrategy::ModifyParameters)
        );
    }

    #[tokio::test]
    async fn test_temporary_failure_retries_until_exhausted() {
        let result = gate(vec![verdict(false, 60, "Page still loading")])
            .verify(&item(1), &execution())
            .await;
        assert_eq!(result.failure_cause, Some(FailureCause::TimingIssue));
        assert_eq!(
            result.recommended_strategy,
            Some(RecoveryStrategy::RetryWithDelays)
        );
        assert_eq!(result.next_action, NextAction::Retry);

        let last = gate(vec![verdict(false, 60, "Page still loading")])
            .verify(&item(3), &execution())
            .await;
        assert_eq!(last.next_action, NextAction::Adjust);
    }

    #[tokio::test]
    async fn test_analysis_failure_is_reported() {
        let result = gate(vec![Err(TriadError::AnalysisFailed(
            "vision backend down".to_string(),
        ))])
        .verify(&item(1), &execution())
        .await;
        assert!(!result.verified);
        assert_eq!(result.confidence, 0);
        assert_eq!(result.next_action, NextAction::Adjust);
        assert!(result
            .analysis_error
            .as_deref()
            .unwrap()
            .contains("vision backend down"));
        assert!(result.screenshot.is_some());
    }

    #[tokio::test]
    async fn test_capture_failure_is_reported() {
        let analysis = Arc::new(MockAnalysis::new(vec![]));
        let gate = VerificationGate::new(
            Arc::new(MockCapture { fail: true }),
            analysis.clone(),
            &VerifyConfig::default(),
        );
        let result = gate.verify(&item(1), &execution()).await;
        assert!(!result.verified);
        assert!(result.analysis_error.is_some());
        assert!(analysis.asked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stuck_screen_turns_retry_into_adjust() {
        let gate = gate(vec![
            verdict(false, 60, "still loading"),
            verdict(false, 60, "still loading"),
        ])
        .with_stuck_detector(StuckDetector::new(3, Arc::new(Frozen)));

        let first = gate.verify(&item(1), &execution()).await;
        assert_eq!(first.next_action, NextAction::Retry);

        let second = gate.verify(&item(2), &execution()).await;
        assert_eq!(second.next_action, NextAction::Adjust);
        assert!(second.reason.contains("stuck: same frame"));
    }

    #[tokio::test]
    async fn test_forget_resets_stuck_history() {
        let detector = StuckDetector::new(3, Arc::new(Frozen));
        let gate = gate(vec![
            verdict(false, 60, "still loading"),
            verdict(false, 60, "still loading"),
        ])
        .with_stuck_detector(detector);

        let first = gate.verify(&item(1), &execution()).await;
        assert_eq!(first.next_action, NextAction::Retry);
        gate.forget("1");

        let second = gate.verify(&item(2), &execution()).await;
        assert_eq!(second.next_action, NextAction::Retry);
        assert!(!second.reason.contains("stuck"));
    }
}
