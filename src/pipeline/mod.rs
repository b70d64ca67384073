//! Batch orchestration: readings -> features -> scaling -> scores -> records -> sink.

pub mod sink;

pub use sink::{persist, AnomalySink, PersistencePolicy, RecordOutcome, RecordStatus, VecSink};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::detect::{
    AnomalyRecord, AnomalyScore, DetectError, ForestModel, ForestParams, IsolationForest, Severity,
};
use crate::features::{self, ScalingStats};
use crate::sensor::SensorReading;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("batch is empty")]
    EmptyBatch,

    #[error("reading {index} has no sensor_id")]
    MissingSensorId { index: usize },

    #[error("invalid configuration: {0}")]
    Configuration(#[from] DetectError),

    #[error("unreadable model snapshot: {0}")]
    SnapshotFormat(#[from] serde_json::Error),

    #[error("rejected model snapshot: {0}")]
    SnapshotRejected(DetectError),
}

/// A fitted model with the scaling it was trained under, for export and
/// later reuse with [`Pipeline::score_with`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub created_at: DateTime<Utc>,
    pub scaling: ScalingStats,
    pub model: ForestModel,
}

impl ModelSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parse and check a snapshot. A structurally broken forest is rejected
    /// here rather than when it is first scored.
    pub fn from_json(s: &str) -> Result<Self, PipelineError> {
        let snapshot: Self = serde_json::from_str(s)?;
        snapshot
            .model
            .validate()
            .map_err(PipelineError::SnapshotRejected)?;
        Ok(snapshot)
    }
}

/// Everything one detection pass produced, before persistence.
#[derive(Debug, Clone)]
pub struct Detection {
    /// One record per input reading, in input order.
    pub records: Vec<AnomalyRecord>,
    pub scaling: ScalingStats,
    /// `None` when the batch was too small to fit and was reported all-normal.
    pub model: Option<ForestModel>,
}

impl Detection {
    /// `None` when no model was fitted.
    pub fn snapshot(&self) -> Option<ModelSnapshot> {
        self.model.as_ref().map(|model| ModelSnapshot {
            created_at: Utc::now(),
            scaling: self.scaling.clone(),
            model: model.clone(),
        })
    }

    pub fn anomalies(&self) -> impl Iterator<Item = &AnomalyRecord> {
        self.records.iter().filter(|r| r.is_anomaly)
    }

    pub fn summary(&self) -> DetectionSummary {
        let mut by_severity: BTreeMap<Severity, usize> = BTreeMap::new();
        for record in self.anomalies() {
            *by_severity.entry(record.severity).or_insert(0) += 1;
        }
        let anomalies: usize = by_severity.values().sum();
        let total = self.records.len();
        DetectionSummary {
            total,
            anomalies,
            anomaly_rate: if total == 0 {
                0.0
            } else {
                100.0 * anomalies as f64 / total as f64
            },
            by_severity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionSummary {
    pub total: usize,
    pub anomalies: usize,
    /// Percentage of the batch flagged anomalous.
    pub anomaly_rate: f64,
    pub by_severity: BTreeMap<Severity, usize>,
}

/// Outcome of a full run, including per-record persistence status.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: DetectionSummary,
    /// One entry per record handed to the sink, in append order.
    pub statuses: Vec<RecordOutcome>,
}

impl BatchReport {
    pub fn persisted(&self) -> usize {
        self.statuses.iter().filter(|s| s.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.statuses.len() - self.persisted()
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    forest: IsolationForest,
    policy: PersistencePolicy,
}

impl Pipeline {
    /// Build a pipeline. Invalid forest parameters are rejected here, before
    /// any batch is touched.
    pub fn new(params: ForestParams, policy: PersistencePolicy) -> Result<Self, PipelineError> {
        Ok(Self {
            forest: IsolationForest::new(params)?,
            policy,
        })
    }

    pub fn params(&self) -> &ForestParams {
        self.forest.params()
    }

    pub fn policy(&self) -> PersistencePolicy {
        self.policy
    }

    fn validate_batch(readings: &[SensorReading]) -> Result<(), PipelineError> {
        if readings.is_empty() {
            return Err(PipelineError::EmptyBatch);
        }
        if let Some(index) = readings.iter().position(|r| !r.has_sensor_id()) {
            return Err(PipelineError::MissingSensorId { index });
        }
        Ok(())
    }

    fn to_records(readings: &[SensorReading], scores: &[AnomalyScore]) -> Vec<AnomalyRecord> {
        readings
            .iter()
            .zip(scores)
            .map(|(reading, score)| AnomalyRecord::new(reading, *score))
            .collect()
    }

    /// Fit scaling and a fresh forest on this batch, then score it.
    pub fn detect(&self, readings: &[SensorReading]) -> Result<Detection, PipelineError> {
        Self::validate_batch(readings)?;

        let rows = features::assemble(readings);
        let (normalized, scaling) = features::normalize(&rows);
        let scored = self.forest.score_batch(&normalized);

        Ok(Detection {
            records: Self::to_records(readings, &scored.scores),
            scaling,
            model: scored.model,
        })
    }

    /// Score a batch against a model and scaling retained from an earlier
    /// batch. Absent values are filled from the retained means.
    pub fn score_with(
        &self,
        model: &ForestModel,
        scaling: &ScalingStats,
        readings: &[SensorReading],
    ) -> Result<Detection, PipelineError> {
        Self::validate_batch(readings)?;

        let rows = features::assemble_with_fill(readings, &scaling.means);
        let normalized = scaling.transform(&rows);
        let scores = model.score(&normalized);

        Ok(Detection {
            records: Self::to_records(readings, &scores),
            scaling: scaling.clone(),
            model: Some(model.clone()),
        })
    }

    /// Detect on the batch and append the selected records to `sink`.
    /// A failed append is reported in the status list and does not stop the
    /// remaining appends.
    pub fn run(
        &self,
        readings: &[SensorReading],
        sink: &mut dyn AnomalySink,
    ) -> Result<BatchReport, PipelineError> {
        self.run_detailed(readings, sink).map(|(report, _)| report)
    }

    /// Like [`Pipeline::run`], also handing back the detection so the caller
    /// can keep the fitted model and scaling.
    pub fn run_detailed(
        &self,
        readings: &[SensorReading],
        sink: &mut dyn AnomalySink,
    ) -> Result<(BatchReport, Detection), PipelineError> {
        let started_at = Utc::now();
        let detection = self.detect(readings)?;
        let report = self.commit(started_at, &detection, sink);
        Ok((report, detection))
    }

    /// Score the batch against a retained model and scaling, then append the
    /// selected records to `sink` as [`Pipeline::run`] does.
    pub fn run_with(
        &self,
        model: &ForestModel,
        scaling: &ScalingStats,
        readings: &[SensorReading],
        sink: &mut dyn AnomalySink,
    ) -> Result<(BatchReport, Detection), PipelineError> {
        let started_at = Utc::now();
        let detection = self.score_with(model, scaling, readings)?;
        let report = self.commit(started_at, &detection, sink);
        Ok((report, detection))
    }

    /// Append the records the policy admits and build the report.
    fn commit(&self, started_at: DateTime<Utc>, detection: &Detection, sink: &mut dyn AnomalySink) -> BatchReport {
        let run_id = Uuid::new_v4();
        let summary = detection.summary();

        let selected: Vec<(usize, &AnomalyRecord)> = detection
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| self.policy.admits(r))
            .collect();
        let statuses = persist(selected.iter().map(|(_, r)| *r), sink);
        let statuses = selected
            .iter()
            .zip(statuses)
            .map(|((index, record), status)| RecordOutcome::new(*index, record, status))
            .collect();

        let report = BatchReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            summary,
            statuses,
        };

        if report.failed() > 0 {
            warn!(
                %run_id,
                persisted = report.persisted(),
                failed = report.failed(),
                "some records could not be persisted"
            );
        }
        info!(
            %run_id,
            batch_size = report.summary.total,
            anomalies = report.summary.anomalies,
            persisted = report.persisted(),
            "detection run complete"
        );
        report
    }
}
