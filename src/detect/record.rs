//! The persisted unit of a detection run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AnomalyScore, Severity};
use crate::sensor::{Channel, SensorReading, CHANNEL_COUNT};

/// All nine channel values of a record. Absent readings are stored as 0.0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelValues {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub vibration_x: f64,
    pub vibration_y: f64,
    pub vibration_z: f64,
    pub current: f64,
    pub voltage: f64,
    pub power: f64,
}

impl ChannelValues {
    pub fn from_reading(reading: &SensorReading) -> Self {
        let mut v = [0.0; CHANNEL_COUNT];
        for channel in Channel::ALL {
            v[channel.index()] = reading.get(channel).unwrap_or(0.0);
        }
        Self::from_array(v)
    }

    pub fn from_array(v: [f64; CHANNEL_COUNT]) -> Self {
        Self {
            temperature: v[0],
            humidity: v[1],
            pressure: v[2],
            vibration_x: v[3],
            vibration_y: v[4],
            vibration_z: v[5],
            current: v[6],
            voltage: v[7],
            power: v[8],
        }
    }

    pub fn to_array(&self) -> [f64; CHANNEL_COUNT] {
        [
            self.temperature,
            self.humidity,
            self.pressure,
            self.vibration_x,
            self.vibration_y,
            self.vibration_z,
            self.current,
            self.voltage,
            self.power,
        ]
    }
}

/// A scored, severity-tagged reading ready to be appended to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub sensor_id: String,
    #[serde(flatten)]
    pub channels: ChannelValues,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub severity: Severity,
    /// `None` lets the sink stamp the insertion time.
    pub timestamp: Option<DateTime<Utc>>,
}

impl AnomalyRecord {
    pub fn new(reading: &SensorReading, score: AnomalyScore) -> Self {
        Self {
            sensor_id: reading.sensor_id.clone(),
            channels: ChannelValues::from_reading(reading),
            anomaly_score: score.decision_score,
            is_anomaly: score.is_anomaly,
            severity: Severity::from_score(score.decision_score),
            timestamp: Some(reading.timestamp),
        }
    }
}
