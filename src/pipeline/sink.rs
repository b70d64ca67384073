//! Where records go, and which ones are sent there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::detect::AnomalyRecord;
use crate::storage::PersistenceError;

/// An append-only destination for anomaly records.
pub trait AnomalySink {
    fn append(&mut self, record: &AnomalyRecord) -> Result<(), PersistenceError>;
}

/// Which scored records a run hands to the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistencePolicy {
    /// Only readings flagged anomalous.
    #[default]
    #[serde(rename = "anomalies")]
    AnomaliesOnly,
    /// Every scored reading, anomalous or not.
    All,
}

impl PersistencePolicy {
    pub fn admits(&self, record: &AnomalyRecord) -> bool {
        match self {
            PersistencePolicy::AnomaliesOnly => record.is_anomaly,
            PersistencePolicy::All => true,
        }
    }
}

/// Per-record persistence outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RecordStatus {
    Ok,
    Failed { error: String },
}

impl RecordStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RecordStatus::Ok)
    }
}

/// A [`RecordStatus`] tied to the record it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordOutcome {
    /// Position of the record in the scored batch.
    pub index: usize,
    pub sensor_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub status: RecordStatus,
}

impl RecordOutcome {
    pub fn new(index: usize, record: &AnomalyRecord, status: RecordStatus) -> Self {
        Self {
            index,
            sensor_id: record.sensor_id.clone(),
            timestamp: record.timestamp,
            status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Append each record independently. One failure never blocks the rest.
pub fn persist<'a>(
    records: impl IntoIterator<Item = &'a AnomalyRecord>,
    sink: &mut dyn AnomalySink,
) -> Vec<RecordStatus> {
    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| match sink.append(record) {
            Ok(()) => RecordStatus::Ok,
            Err(e) => {
                warn!(index = i, sensor_id = %record.sensor_id, error = %e, "failed to persist anomaly record");
                RecordStatus::Failed {
                    error: e.to_string(),
                }
            }
        })
        .collect()
}

/// In-memory sink.
#[derive(Debug, Default)]
pub struct VecSink {
    pub records: Vec<AnomalyRecord>,
}

impl AnomalySink for VecSink {
    fn append(&mut self, record: &AnomalyRecord) -> Result<(), PersistenceError> {
        self.records.push(record.clone());
        Ok(())
    }
}
