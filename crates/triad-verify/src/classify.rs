//! Failure-cause classification and next-action decision
//!
//! Analysis backends should report a structured `FailureCause`. The keyword
//! tables here only cover free-text reasons from backends that do not. A
//! reason mentioning several causes resolves to the first matching class in
//! table order, so "tool failed because the element was not found" is a tool
//! failure, not a wrong approach.

use triad_core::{FailureCause, NextAction};

const CAUSE_KEYWORDS: &[(FailureCause, &[&str])] = &[
    (
        FailureCause::TimingIssue,
        &["timeout", "timed out", "loading", "not yet", "delay"],
    ),
    (
        FailureCause::ToolExecutionFailed,
        &["tool failed", "execution failed", "error executing", "crash"],
    ),
    (
        FailureCause::WrongParameters,
        &[
            "invalid parameter",
            "wrong parameter",
            "wrong value",
            "invalid argument",
        ],
    ),
    (
        FailureCause::WrongApproach,
        &["wrong approach", "not found", "missing", "no such"],
    ),
    (
        FailureCause::UnrealisticCriteria,
        &["unrealistic", "impossible", "cannot be verified"],
    ),
    (
        FailureCause::UnclearState,
        &["unclear", "ambiguous", "cannot determine"],
    ),
];

/// Failures that may clear up on their own
const TEMPORARY_KEYWORDS: &[&str] = &["timeout", "timed out", "network", "connection", "loading"];

/// Failures that repeating the same step will not fix
const STRUCTURAL_KEYWORDS: &[&str] = &["not found", "invalid", "missing", "wrong"];

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

/// Keyword fallback for reasons without a structured cause
pub fn classify_failure(reason: &str) -> FailureCause {
    let reason = reason.to_lowercase();
    CAUSE_KEYWORDS
        .iter()
        .find(|(_, keywords)| contains_any(&reason, keywords))
        .map(|(cause, _)| *cause)
        .unwrap_or_default()
}

pub fn is_temporary(reason: &str) -> bool {
    contains_any(&reason.to_lowercase(), TEMPORARY_KEYWORDS)
}

pub fn is_structural(reason: &str) -> bool {
    contains_any(&reason.to_lowercase(), STRUCTURAL_KEYWORDS)
}

/// Inputs to the next-action decision
#[derive(Debug, Clone, Copy)]
pub struct Outcome<'a> {
    pub verified: bool,
    pub confidence: u8,
    pub reason: &'a str,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Decide what follows a verification, in priority order:
///
/// 1. verified → `Continue`
/// 2. attempts exhausted → `Adjust`
/// 3. temporary failure → `Retry`
/// 4. structural failure → `Adjust`
/// 5. confidence below `low_confidence` → `Adjust`
/// 6. anything else → `Adjust`
pub fn decide_next_action(outcome: Outcome<'_>, low_confidence: u8) -> NextAction {
    if outcome.verified {
        return NextAction::Continue;
    }
    if outcome.attempt >= outcome.max_attempts {
        return NextAction::Adjust;
    }
    if is_temporary(outcome.reason) {
        return NextAction::Retry;
    }
    if is_structural(outcome.reason) || outcome.confidence < low_confidence {
        return NextAction::Adjust;
    }
    NextAction::Adjust
}
