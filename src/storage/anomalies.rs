use std::collections::BTreeMap;

use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use tracing::debug;

use super::{format_ts, parse_ts, window_start, PersistenceError, Pool};
use crate::detect::{AnomalyRecord, ChannelValues, Severity};
use crate::pipeline::AnomalySink;

/// Append one record. A missing timestamp falls back to the column default.
///
/// At most one row is kept per `(sensor_id, timestamp)`: re-scoring a window
/// that overlaps an earlier run leaves the first row in place. Returns whether
/// a new row was written.
pub fn insert_anomaly(conn: &Connection, record: &AnomalyRecord) -> Result<bool, PersistenceError> {
    let c = &record.channels;
    let inserted = conn.execute(
        "INSERT INTO anomalies (
            sensor_id, timestamp, temperature, humidity, pressure,
            vibration_x, vibration_y, vibration_z, \"current\", voltage, power,
            anomaly_score, is_anomaly, severity
        ) VALUES (
            ?1, COALESCE(?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now')), ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10, ?11,
            ?12, ?13, ?14
        )
        ON CONFLICT(sensor_id, timestamp) DO NOTHING",
        params![
            record.sensor_id,
            record.timestamp.as_ref().map(format_ts),
            c.temperature,
            c.humidity,
            c.pressure,
            c.vibration_x,
            c.vibration_y,
            c.vibration_z,
            c.current,
            c.voltage,
            c.power,
            record.anomaly_score,
            record.is_anomaly,
            record.severity.as_str()
        ],
    )?;
    if inserted == 0 {
        debug!(sensor_id = %record.sensor_id, "reading already recorded, skipped");
    }
    Ok(inserted > 0)
}

/// The relational sink: one pooled connection checkout per record.
#[derive(Clone)]
pub struct SqliteSink {
    pool: Pool,
}

impl SqliteSink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl AnomalySink for SqliteSink {
    fn append(&mut self, record: &AnomalyRecord) -> Result<(), PersistenceError> {
        let conn = self.pool.get()?;
        insert_anomaly(&conn, record).map(|_| ())
    }
}

/// Most recent anomaly rows within the trailing window, newest first.
pub fn list_recent_anomalies(conn: &Connection, limit: usize, hours_back: u32) -> Result<Vec<AnomalyRecord>> {
    let mut stmt = conn.prepare(
        "SELECT sensor_id, timestamp, temperature, humidity, pressure,
                vibration_x, vibration_y, vibration_z, \"current\", voltage, power,
                anomaly_score, is_anomaly, severity
         FROM anomalies
         WHERE timestamp >= ?1
         ORDER BY timestamp DESC, id DESC
         LIMIT ?2",
    )?;

    let rows = stmt.query_map(params![window_start(hours_back), limit as i64], |row| {
        let mut v = [0.0; 9];
        for (i, slot) in v.iter_mut().enumerate() {
            *slot = row.get(i + 2)?;
        }
        let severity: String = row.get(13)?;
        let severity = severity
            .parse::<Severity>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(13, Type::Text, e.into()))?;
        Ok(AnomalyRecord {
            sensor_id: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
            timestamp: parse_ts(&row.get::<_, String>(1)?),
            channels: ChannelValues::from_array(v),
            anomaly_score: row.get(11)?,
            is_anomaly: row.get(12)?,
            severity,
        })
    })?;

    let mut records = Vec::new();
    for r in rows {
        records.push(r?);
    }
    Ok(records)
}

/// Count of flagged anomalies per severity within the trailing window.
pub fn severity_counts(conn: &Connection, hours_back: u32) -> Result<BTreeMap<Severity, usize>> {
    let mut stmt = conn.prepare(
        "SELECT severity, COUNT(*) FROM anomalies
         WHERE timestamp >= ?1 AND is_anomaly = 1
         GROUP BY severity",
    )?;
    let rows = stmt.query_map(params![window_start(hours_back)], |row| {
        let severity: String = row.get(0)?;
        let severity = severity
            .parse::<Severity>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into()))?;
        Ok((severity, row.get::<_, i64>(1)?))
    })?;

    let mut counts: BTreeMap<Severity, usize> = Severity::ALL.iter().map(|s| (*s, 0)).collect();
    for r in rows {
        let (severity, count) = r?;
        *counts.entry(severity).or_insert(0) += count as usize;
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::AnomalyScore;
    use crate::pipeline::persist;
    use crate::sensor::{Channel, SensorReading};
    use crate::storage::{open_pool, schema::migrate};
    use chrono::{Duration, Utc};

    fn record(id: &str, score: f64) -> AnomalyRecord {
        let reading = SensorReading::new(id, Utc::now()).with(Channel::VibrationX, 7.5);
        AnomalyRecord::new(&reading, AnomalyScore::from_decision(score))
    }

    #[test]
    fn test_insert_and_list() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        insert_anomaly(&conn, &record("VIB_001", -0.12)).unwrap();
        insert_anomaly(&conn, &record("VIB_002", -0.61)).unwrap();

        let listed = list_recent_anomalies(&conn, 10, 24).unwrap();
        assert_eq!(listed.len(), 2);
        let critical = listed.iter().find(|r| r.sensor_id == "VIB_002").unwrap();
        assert_eq!(critical.severity, Severity::Critical);
        assert_eq!(critical.channels.vibration_x, 7.5);
        assert_eq!(critical.channels.power, 0.0);
        assert!(critical.is_anomaly);
        assert!(critical.timestamp.is_some());

        assert_eq!(list_recent_anomalies(&conn, 1, 24).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_timestamp_uses_insert_time() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let mut r = record("TEMP_001", -0.35);
        r.timestamp = None;
        insert_anomaly(&conn, &r).unwrap();

        let listed = list_recent_anomalies(&conn, 10, 1).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].timestamp.is_some());
    }

    #[test]
    fn test_severity_counts() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        for (i, score) in [-0.05, -0.2, -0.25, -0.7].into_iter().enumerate() {
            let mut r = record("S", score);
            r.timestamp = Some(Utc::now() - Duration::seconds(i as i64));
            insert_anomaly(&conn, &r).unwrap();
        }
        let counts = severity_counts(&conn, 24).unwrap();
        assert_eq!(counts[&Severity::Low], 1);
        assert_eq!(counts[&Severity::Medium], 2);
        assert_eq!(counts[&Severity::High], 0);
        assert_eq!(counts[&Severity::Critical], 1);
    }

    #[test]
    fn test_sqlite_sink_appends() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("sink.db");
        let pool = open_pool(path.to_str().unwrap())?;
        let mut sink = SqliteSink::new(pool.clone());

        let records = vec![record("A", -0.2), record("B", -0.4)];
        let statuses = persist(&records, &mut sink);
        assert!(statuses.iter().all(|s| s.is_ok()));

        let conn = pool.get()?;
        assert_eq!(list_recent_anomalies(&conn, 10, 24)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_same_reading_is_stored_once() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let r = record("TEMP_002", -0.4);
        assert!(insert_anomaly(&conn, &r).unwrap());
        assert!(!insert_anomaly(&conn, &r).unwrap());

        let mut rescored = r.clone();
        rescored.anomaly_score = -0.7;
        rescored.severity = Severity::Critical;
        assert!(!insert_anomaly(&conn, &rescored).unwrap());

        let listed = list_recent_anomalies(&conn, 10, 24).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].severity, Severity::High);
    }

    #[test]
    fn test_unknown_severity_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO anomalies (sensor_id, anomaly_score, is_anomaly, severity)
             VALUES ('VIB_001', -0.2, 1, 'SEVERE')",
            [],
        )
        .unwrap();

        assert!(list_recent_anomalies(&conn, 10, 24).is_err());
        assert!(severity_counts(&conn, 24).is_err());
    }
}
