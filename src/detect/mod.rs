//! Anomaly scoring and severity classification.

pub mod forest;
pub mod record;

pub use forest::{AnomalyScore, BatchScores, ForestModel, ForestParams, IsolationForest};
pub use record::{AnomalyRecord, ChannelValues};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DetectError {
    #[error("contamination must be in (0, 0.5], got {0}")]
    InvalidContamination(f64),

    #[error("invalid forest parameters: {0}")]
    InvalidForestParams(String),

    #[error("insufficient samples: need {needed}, have {have}")]
    InsufficientSamples { needed: usize, have: usize },

    #[error("invalid model: {0}")]
    InvalidModel(String),
}

/// Severity tiers, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    /// Map a decision score to a tier by its magnitude. Thresholds are strict:
    /// exactly 0.5 is HIGH, not CRITICAL.
    pub fn from_score(score: f64) -> Self {
        let magnitude = score.abs();
        if magnitude > 0.5 {
            Severity::Critical
        } else if magnitude > 0.3 {
            Severity::High
        } else if magnitude > 0.1 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}
