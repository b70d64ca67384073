//! End-to-end detection scenarios over the public API.

use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use sensorguard::detect::{AnomalyRecord, AnomalyScore, ForestParams, Severity};
use sensorguard::pipeline::{persist, AnomalySink, PersistencePolicy, Pipeline, RecordStatus, VecSink};
use sensorguard::sensor::{Channel, SensorReading};
use sensorguard::storage::PersistenceError;

const BASELINES: [(Channel, f64, f64); 9] = [
    (Channel::Temperature, 45.0, 1.0),
    (Channel::Humidity, 50.0, 2.0),
    (Channel::Pressure, 1013.25, 1.0),
    (Channel::VibrationX, 2.5, 0.1),
    (Channel::VibrationY, 2.5, 0.1),
    (Channel::VibrationZ, 2.5, 0.1),
    (Channel::Current, 5.2, 0.2),
    (Channel::Voltage, 230.0, 1.0),
    (Channel::Power, 1200.0, 20.0),
];

fn normal_reading(rng: &mut StdRng, k: usize) -> SensorReading {
    let mut r = SensorReading::new(format!("SENSOR_{:02}", k), Utc::now() - Duration::minutes(k as i64));
    for (channel, mean, sd) in BASELINES {
        let noise = Normal::new(0.0, sd).unwrap().sample(rng);
        r = r.with(channel, mean + noise);
    }
    r
}

/// 18 clustered readings followed by two readings with one channel shifted
/// far beyond its spread.
fn scenario_a_batch() -> Vec<SensorReading> {
    let mut rng = StdRng::seed_from_u64(2024);
    let mut batch: Vec<SensorReading> = (0..18).map(|k| normal_reading(&mut rng, k)).collect();

    let hot = normal_reading(&mut rng, 18).with(Channel::Temperature, 45.0 + 25.0 * 1.0);
    let shaking = normal_reading(&mut rng, 19).with(Channel::VibrationX, 2.5 + 25.0 * 0.1);
    batch.push(hot);
    batch.push(shaking);
    batch
}

#[test]
fn scenario_a_flags_the_outliers() {
    let pipeline = Pipeline::new(ForestParams::default(), PersistencePolicy::AnomaliesOnly).unwrap();
    let detection = pipeline.detect(&scenario_a_batch()).unwrap();

    assert_eq!(detection.records.len(), 20);
    let flagged: Vec<usize> = detection
        .records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_anomaly)
        .map(|(i, _)| i)
        .collect();

    assert!(flagged.iter().any(|i| *i >= 18), "flagged: {flagged:?}");
    assert!(flagged.len() <= 3, "flagged: {flagged:?}");
    for r in detection.anomalies() {
        assert!(r.anomaly_score < 0.0);
    }
}

#[test]
fn scenario_a_is_deterministic_for_a_seed() {
    let pipeline = Pipeline::new(ForestParams::default(), PersistencePolicy::All).unwrap();
    let batch = scenario_a_batch();
    let a = pipeline.detect(&batch).unwrap();
    let b = pipeline.detect(&batch).unwrap();
    assert_eq!(a.records, b.records);
}

#[test]
fn scenario_b_severity_tiers() {
    assert_eq!(Severity::from_score(0.42), Severity::High);
    assert_eq!(Severity::from_score(-0.6), Severity::Critical);
    assert_eq!(Severity::from_score(0.05), Severity::Low);

    let reading = SensorReading::new("TEMP_001", Utc::now()).with(Channel::Temperature, 80.0);
    let record = AnomalyRecord::new(&reading, AnomalyScore::from_decision(-0.6));
    assert_eq!(record.severity, Severity::Critical);
    assert!(record.is_anomaly);
    assert_eq!(record.channels.temperature, 80.0);
    assert_eq!(record.channels.power, 0.0);
}

/// Fails the `fail_on`-th append (1-based).
struct FlakySink {
    calls: usize,
    fail_on: usize,
    stored: Vec<String>,
}

impl AnomalySink for FlakySink {
    fn append(&mut self, record: &AnomalyRecord) -> Result<(), PersistenceError> {
        self.calls += 1;
        if self.calls == self.fail_on {
            return Err(PersistenceError::Rejected("disk full".into()));
        }
        self.stored.push(record.sensor_id.clone());
        Ok(())
    }
}

#[test]
fn scenario_c_failed_write_does_not_stop_the_batch() {
    let records: Vec<AnomalyRecord> = (1..=5)
        .map(|k| {
            let reading = SensorReading::new(format!("S{k}"), Utc::now()).with(Channel::Power, 900.0);
            AnomalyRecord::new(&reading, AnomalyScore::from_decision(-0.2))
        })
        .collect();

    let mut sink = FlakySink {
        calls: 0,
        fail_on: 3,
        stored: Vec::new(),
    };
    let statuses = persist(&records, &mut sink);

    let ok: Vec<bool> = statuses.iter().map(RecordStatus::is_ok).collect();
    assert_eq!(ok, vec![true, true, false, true, true]);
    assert_eq!(sink.stored, vec!["S1", "S2", "S4", "S5"]);
    match &statuses[2] {
        RecordStatus::Failed { error } => assert!(error.contains("disk full")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn scenario_c_through_the_pipeline() {
    let mut rng = StdRng::seed_from_u64(9);
    let batch: Vec<SensorReading> = (0..5).map(|k| normal_reading(&mut rng, k)).collect();

    let pipeline = Pipeline::new(ForestParams::default(), PersistencePolicy::All).unwrap();
    let mut sink = FlakySink {
        calls: 0,
        fail_on: 3,
        stored: Vec::new(),
    };
    let report = pipeline.run(&batch, &mut sink).unwrap();

    assert_eq!(report.statuses.len(), 5);
    assert_eq!(report.persisted(), 4);
    assert_eq!(report.failed(), 1);

    let failed = &report.statuses[2];
    assert!(!failed.is_ok());
    assert_eq!(failed.index, 2);
    assert_eq!(failed.sensor_id, batch[2].sensor_id);
    assert_eq!(failed.timestamp, Some(batch[2].timestamp));
    assert!(matches!(&failed.status, RecordStatus::Failed { error } if error.contains("disk full")));
}

#[test]
fn failed_write_names_the_reading_when_only_anomalies_are_kept() {
    let batch = scenario_a_batch();
    let pipeline = Pipeline::new(ForestParams::default(), PersistencePolicy::AnomaliesOnly).unwrap();
    let mut sink = FlakySink {
        calls: 0,
        fail_on: 1,
        stored: Vec::new(),
    };
    let (report, detection) = pipeline.run_detailed(&batch, &mut sink).unwrap();

    let flagged: Vec<usize> = detection
        .records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_anomaly)
        .map(|(i, _)| i)
        .collect();
    let reported: Vec<usize> = report.statuses.iter().map(|o| o.index).collect();
    assert_eq!(reported, flagged);

    let failed = &report.statuses[0];
    assert!(!failed.is_ok());
    assert_eq!(failed.sensor_id, batch[failed.index].sensor_id);
    assert_eq!(report.failed(), 1);
}

#[test]
fn tiny_batch_is_reported_normal() {
    let pipeline = Pipeline::new(ForestParams::default(), PersistencePolicy::All).unwrap();
    let reading = SensorReading::new("VIB_001", Utc::now()).with(Channel::VibrationX, 40.0);

    let mut sink = VecSink::default();
    let report = pipeline.run(&[reading], &mut sink).unwrap();
    assert_eq!(report.summary.anomalies, 0);
    assert_eq!(sink.records.len(), 1);
    assert_eq!(sink.records[0].anomaly_score, 0.0);
    assert_eq!(sink.records[0].severity, Severity::Low);
}
