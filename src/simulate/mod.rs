//! Synthetic sensor readings for demos and tests.
//!
//! Six sensors across three families, each emitting readings around a fixed
//! baseline with Gaussian noise. A small fraction of readings is pushed far
//! off baseline to give the detector something to find.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SimulatorConfig;
use crate::sensor::{Channel, SensorKind, SensorReading};
use crate::storage;

const NOMINAL_HUMIDITY: f64 = 50.0;
const NOMINAL_PRESSURE: f64 = 1013.25;
const NOMINAL_VOLTAGE: f64 = 230.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorProfile {
    pub sensor_id: String,
    pub kind: SensorKind,
    /// Centre of the primary channel.
    pub baseline: f64,
    /// Standard deviation of the primary channel.
    pub variation: f64,
    pub location: Option<String>,
}

impl SensorProfile {
    pub fn new(sensor_id: &str, kind: SensorKind, baseline: f64, variation: f64) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            kind,
            baseline,
            variation,
            location: None,
        }
    }
}

pub fn default_profiles() -> Vec<SensorProfile> {
    vec![
        SensorProfile::new("TEMP_001", SensorKind::Temperature, 45.0, 5.0),
        SensorProfile::new("TEMP_002", SensorKind::Temperature, 38.0, 4.0),
        SensorProfile::new("VIB_001", SensorKind::Vibration, 2.5, 0.8),
        SensorProfile::new("VIB_002", SensorKind::Vibration, 3.2, 1.0),
        SensorProfile::new("POWER_001", SensorKind::Power, 1200.0, 200.0),
        SensorProfile::new("POWER_002", SensorKind::Power, 800.0, 150.0),
    ]
}

fn round(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

fn gauss(rng: &mut StdRng, sigma: f64) -> f64 {
    Normal::new(0.0, sigma.abs())
        .map(|n| n.sample(rng))
        .unwrap_or(0.0)
}

pub struct Simulator {
    profiles: Vec<SensorProfile>,
    anomaly_probability: f64,
    rng: StdRng,
}

impl Simulator {
    pub fn new(profiles: Vec<SensorProfile>, config: &SimulatorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            profiles,
            anomaly_probability: config.anomaly_probability.clamp(0.0, 1.0),
            rng,
        }
    }

    pub fn profiles(&self) -> &[SensorProfile] {
        &self.profiles
    }

    /// One reading per sensor, all stamped `timestamp`.
    pub fn tick(&mut self, timestamp: DateTime<Utc>) -> Vec<SensorReading> {
        let p = self.anomaly_probability;
        let rng = &mut self.rng;
        self.profiles
            .iter()
            .map(|profile| generate(profile, rng, p, timestamp))
            .collect()
    }

    /// Readings every `step_minutes` from `end - hours` up to (not including) `end`.
    pub fn history(&mut self, end: DateTime<Utc>, hours: u32, step_minutes: u32) -> Vec<SensorReading> {
        let step = Duration::minutes(i64::from(step_minutes.max(1)));
        let mut t = end - Duration::hours(i64::from(hours));
        let mut out = Vec::new();
        while t < end {
            out.extend(self.tick(t));
            t += step;
        }
        debug!(readings = out.len(), hours, step_minutes, "generated history");
        out
    }
}

/// A single reading for `profile`. With probability `p_anomaly` the primary
/// channel is pushed well outside its normal spread.
pub fn generate(profile: &SensorProfile, rng: &mut StdRng, p_anomaly: f64, timestamp: DateTime<Utc>) -> SensorReading {
    let anomalous = rng.gen_bool(p_anomaly);
    let reading = SensorReading::new(profile.sensor_id.clone(), timestamp);

    match profile.kind {
        SensorKind::Temperature => {
            let temperature = if anomalous {
                profile.baseline + rng.gen_range(-15.0_f64..20.0)
            } else {
                profile.baseline + gauss(rng, profile.variation)
            };
            let humidity = (NOMINAL_HUMIDITY + gauss(rng, 10.0)).clamp(20.0, 80.0);
            let pressure = NOMINAL_PRESSURE + gauss(rng, 5.0);
            reading
                .with(Channel::Temperature, round(temperature, 2))
                .with(Channel::Humidity, round(humidity, 2))
                .with(Channel::Pressure, round(pressure, 2))
        }
        SensorKind::Vibration => {
            let multiplier = if anomalous { rng.gen_range(3.0_f64..8.0) } else { 1.0 };
            let base = profile.baseline * multiplier;
            reading
                .with(Channel::VibrationX, round(base + gauss(rng, 0.3), 3))
                .with(Channel::VibrationY, round(base + gauss(rng, 0.3), 3))
                .with(Channel::VibrationZ, round(base + gauss(rng, 0.2), 3))
        }
        SensorKind::Power => {
            let power = if anomalous {
                profile.baseline + rng.gen_range(-400.0_f64..500.0)
            } else {
                profile.baseline + gauss(rng, profile.variation)
            };
            let voltage = NOMINAL_VOLTAGE + gauss(rng, 5.0);
            let current = if voltage > 0.0 { power / voltage } else { 0.0 };
            reading
                .with(Channel::Current, round(current, 2))
                .with(Channel::Voltage, round(voltage, 2))
                .with(Channel::Power, round(power, 2))
        }
    }
}

/// Register every profile in the sensor registry.
pub fn register_profiles(conn: &Connection, profiles: &[SensorProfile]) -> Result<()> {
    for p in profiles {
        storage::register_sensor(conn, &p.sensor_id, p.kind, p.location.as_deref())?;
    }
    Ok(())
}

/// Write readings in one transaction. Returns how many were written.
pub fn write_readings(conn: &mut Connection, readings: &[SensorReading]) -> Result<usize> {
    let tx = conn.transaction()?;
    for r in readings {
        storage::save_reading(&tx, r)?;
    }
    tx.commit()?;
    Ok(readings.len())
}
