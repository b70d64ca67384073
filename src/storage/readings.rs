use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{params, Connection};

use super::{format_ts, parse_ts, window_start};
use crate::sensor::{SensorKind, SensorReading, CHANNEL_COUNT};

/// Add a sensor to the registry. Re-registering an id is a no-op.
pub fn register_sensor(conn: &Connection, sensor_id: &str, kind: SensorKind, location: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO sensors (sensor_id, sensor_type, location) VALUES (?1, ?2, ?3)",
        params![sensor_id, kind.to_string(), location],
    )?;
    Ok(())
}

/// Save a raw reading. Absent channels are stored as NULL.
pub fn save_reading(conn: &Connection, r: &SensorReading) -> Result<()> {
    let v = &r.values;
    conn.execute(
        "INSERT INTO sensor_data (
            sensor_id, timestamp, temperature, humidity, pressure,
            vibration_x, vibration_y, vibration_z, \"current\", voltage, power
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            r.sensor_id,
            format_ts(&r.timestamp),
            v[0],
            v[1],
            v[2],
            v[3],
            v[4],
            v[5],
            v[6],
            v[7],
            v[8]
        ],
    )?;
    Ok(())
}

/// Readings from the trailing `hours_back` hours, oldest first.
pub fn load_readings(conn: &Connection, hours_back: u32) -> Result<Vec<SensorReading>> {
    let mut stmt = conn.prepare(
        "SELECT sensor_id, timestamp, temperature, humidity, pressure,
                vibration_x, vibration_y, vibration_z, \"current\", voltage, power
         FROM sensor_data
         WHERE timestamp >= ?1
         ORDER BY timestamp ASC, id ASC",
    )?;

    let rows = stmt.query_map(params![window_start(hours_back)], |row| {
        let ts: String = row.get(1)?;
        let timestamp = parse_ts(&ts).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(1, Type::Text, format!("bad timestamp: {ts}").into())
        })?;

        let mut values = [None; CHANNEL_COUNT];
        for (i, slot) in values.iter_mut().enumerate() {
            *slot = row.get::<_, Option<f64>>(i + 2)?;
        }

        Ok(SensorReading {
            sensor_id: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
            timestamp,
            values,
        })
    })?;

    let mut readings = Vec::new();
    for r in rows {
        readings.push(r?);
    }
    Ok(readings)
}
