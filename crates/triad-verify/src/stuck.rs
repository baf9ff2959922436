//! Rolling-window stuck detection
//!
//! Fails open: any error from the analysis backend reads as "not stuck".

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use triad_core::fail_open::fail_open_or;

use crate::analysis::{StuckAnalysis, StuckAssessment};

/// Minimum snapshots before a judgement is made
pub const MIN_SAMPLES: usize = 2;

pub struct StuckDetector {
    window: usize,
    analysis: Arc<dyn StuckAnalysis>,
    history: Mutex<HashMap<String, VecDeque<String>>>,
}

impl StuckDetector {
    pub fn new(window: usize, analysis: Arc<dyn StuckAnalysis>) -> Self {
        Self {
            window: window.max(MIN_SAMPLES),
            analysis,
            history: Mutex::new(HashMap::new()),
        }
    }

    fn with_history<R>(&self, f: impl FnOnce(&mut HashMap<String, VecDeque<String>>) -> R) -> R {
        match self.history.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Add a snapshot for `key`, dropping the oldest beyond the window
    pub fn record(&self, key: &str, path: impl Into<String>) {
        let window = self.window;
        self.with_history(|history| {
            let entries = history.entry(key.to_string()).or_default();
            entries.push_back(path.into());
            while entries.len() > window {
                entries.pop_front();
            }
        });
    }

    /// Snapshots currently held for `key`, oldest first
    pub fn snapshots(&self, key: &str) -> Vec<String> {
        self.with_history(|history| {
            history
                .get(key)
                .map(|entries| entries.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn forget(&self, key: &str) {
        self.with_history(|history| {
            history.remove(key);
        });
    }

    /// Judge the window for `key`
    pub async fn check(&self, key: &str, expected_activity: &str) -> StuckAssessment {
        let paths = self.snapshots(key);
        if paths.len() < MIN_SAMPLES {
            debug!(key, samples = paths.len(), "Too few snapshots for stuck detection");
            return StuckAssessment::not_stuck("not enough snapshots");
        }

        let assessment = fail_open_or(
            "stuck_detection",
            StuckAssessment::not_stuck("stuck detection unavailable"),
            || self.analysis.detect_stuck_state(&paths, expected_activity),
        )
        .await;

        if assessment.stuck {
            info!(key, confidence = assessment.confidence, "Stuck state detected");
        }
        assessment
    }
}
