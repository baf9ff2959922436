//! Analysis capabilities consumed by the verification gate

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use triad_core::{FailureCause, Result, TriadError, VisualEvidence};

use crate::capture::sha256_hex;

/// Raw verdict from an analysis backend, before gating
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub verified: bool,
    /// As reported; the gate clamps it to 0-100
    pub confidence: i64,
    pub reason: String,
    pub visual_evidence: Option<VisualEvidence>,
    pub failure_cause: Option<FailureCause>,
}

impl Analysis {
    /// Read a loosely shaped JSON verdict
    ///
    /// `confidence` may be an integer, a float, or a numeric string; a
    /// `failure_cause` that is not a known cause is ignored. `evidence` is
    /// accepted as an alias of `visual_evidence`, and a plain string is taken
    /// as the observation.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| TriadError::MalformedPayload("analysis is not an object".to_string()))?;

        let verified = match object.get("verified") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };

        let confidence = match object.get("confidence") {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.round() as i64))
                .unwrap_or(0),
            Some(Value::String(s)) => s
                .trim()
                .trim_end_matches('%')
                .parse::<f64>()
                .map(|f| f.round() as i64)
                .unwrap_or(0),
            _ => 0,
        };

        let reason = object
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let visual_evidence = match object.get("visual_evidence").or_else(|| object.get("evidence")) {
            Some(Value::String(s)) => Some(VisualEvidence {
                observed: s.clone(),
                matches_criteria: verified,
                details: String::new(),
            }),
            Some(other @ Value::Object(_)) => serde_json::from_value(other.clone()).ok(),
            _ => None,
        };

        let failure_cause = object
            .get("failure_cause")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<FailureCause>().ok());

        Ok(Self {
            verified,
            confidence,
            reason,
            visual_evidence,
            failure_cause,
        })
    }
}

/// Judges a snapshot against success criteria
#[async_trait]
pub trait VisionAnalysis: Send + Sync {
    async fn analyze_screenshot(
        &self,
        path: &str,
        criteria: &str,
        context: &str,
    ) -> Result<Analysis>;
}

/// Whether a series of snapshots shows no progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckAssessment {
    pub stuck: bool,
    pub confidence: u8,
    pub reason: String,
}

impl StuckAssessment {
    pub fn not_stuck(reason: impl Into<String>) -> Self {
        Self {
            stuck: false,
            confidence: 0,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait StuckAnalysis: Send + Sync {
    async fn detect_stuck_state(
        &self,
        paths: &[String],
        expected_activity: &str,
    ) -> Result<StuckAssessment>;
}

/// Stuck when every snapshot in the window is byte-identical
#[derive(Debug, Clone, Default)]
pub struct HashStuckAnalysis;

#[async_trait]
impl StuckAnalysis for HashStuckAnalysis {
    async fn detect_stuck_state(
        &self,
        paths: &[String],
        expected_activity: &str,
    ) -> Result<StuckAssessment> {
        if paths.len() < 2 {
            return Ok(StuckAssessment::not_stuck("not enough snapshots"));
        }

        let mut hashes = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(path).await?;
            hashes.push(sha256_hex(&bytes));
        }

        if hashes.windows(2).all(|w| w[0] == w[1]) {
            // Two identical frames are weak evidence; five or more are strong.
            let confidence = (50 + 10 * paths.len()).min(95) as u8;
            Ok(StuckAssessment {
                stuck: true,
                confidence,
                reason: format!(
                    "screen unchanged across {} snapshots while expecting: {}",
                    paths.len(),
                    expected_activity
                ),
            })
        } else {
            Ok(StuckAssessment::not_stuck("screen changed between snapshots"))
        }
    }
}
