//! Sensor readings and the canonical channel layout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of numeric channels carried by every reading.
pub const CHANNEL_COUNT: usize = 9;

/// One named numeric measurement. Declaration order is the canonical
/// feature order used everywhere downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Temperature,
    Humidity,
    Pressure,
    VibrationX,
    VibrationY,
    VibrationZ,
    Current,
    Voltage,
    Power,
}

impl Channel {
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::Temperature,
        Channel::Humidity,
        Channel::Pressure,
        Channel::VibrationX,
        Channel::VibrationY,
        Channel::VibrationZ,
        Channel::Current,
        Channel::Voltage,
        Channel::Power,
    ];

    /// Position of this channel in a feature vector.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Column name used in storage and JSON output.
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Temperature => "temperature",
            Channel::Humidity => "humidity",
            Channel::Pressure => "pressure",
            Channel::VibrationX => "vibration_x",
            Channel::VibrationY => "vibration_y",
            Channel::VibrationZ => "vibration_z",
            Channel::Current => "current",
            Channel::Voltage => "voltage",
            Channel::Power => "power",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broad sensor family. Each family populates a different subset of channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorKind {
    Temperature,
    Vibration,
    Power,
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorKind::Temperature => write!(f, "Temperature"),
            SensorKind::Vibration => write!(f, "Vibration"),
            SensorKind::Power => write!(f, "Power"),
        }
    }
}

/// A time-stamped multi-channel reading. Absent channels are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub values: [Option<f64>; CHANNEL_COUNT],
}

impl SensorReading {
    /// A reading with every channel absent.
    pub fn new(sensor_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp,
            values: [None; CHANNEL_COUNT],
        }
    }

    /// Builder-style setter for one channel.
    pub fn with(mut self, channel: Channel, value: f64) -> Self {
        self.values[channel.index()] = Some(value);
        self
    }

    /// Value of a channel. NaN and infinities count as absent.
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.values[channel.index()].filter(|v| v.is_finite())
    }

    pub fn has_sensor_id(&self) -> bool {
        !self.sensor_id.trim().is_empty()
    }
}
