//! # triad-verify
//!
//! Independent verification of TODO items.
//!
//! The [`VerificationGate`] captures a snapshot through a [`VisualCapture`],
//! has a [`VisionAnalysis`] judge it against the item's success criteria and
//! turns the verdict into a `VerificationResult`: verified only at or above
//! the confidence threshold, with a classified failure cause, a recommended
//! recovery strategy and the next action for the orchestrator.

pub mod agent_analysis;
pub mod analysis;
pub mod capture;
pub mod classify;
mod gate;
pub mod stuck;

pub use agent_analysis::AgentVisionAnalysis;
pub use analysis::{Analysis, HashStuckAnalysis, StuckAnalysis, StuckAssessment, VisionAnalysis};
pub use capture::{CommandCapture, VisualCapture};
pub use gate::VerificationGate;
pub use stuck::StuckDetector;
