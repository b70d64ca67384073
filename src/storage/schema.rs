//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;
use tracing::warn;

/// Columns the anomaly sink writes. A table lacking any of them is rebuilt.
pub const ANOMALY_COLUMNS: [&str; 13] = [
    "temperature",
    "humidity",
    "pressure",
    "vibration_x",
    "vibration_y",
    "vibration_z",
    "current",
    "voltage",
    "power",
    "anomaly_score",
    "is_anomaly",
    "severity",
    "timestamp",
];

const CREATE_ANOMALIES: &str = "
    CREATE TABLE IF NOT EXISTS anomalies (
        id INTEGER PRIMARY KEY,
        sensor_id TEXT,
        timestamp TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        temperature REAL NOT NULL DEFAULT 0.0,
        humidity REAL NOT NULL DEFAULT 0.0,
        pressure REAL NOT NULL DEFAULT 0.0,
        vibration_x REAL NOT NULL DEFAULT 0.0,
        vibration_y REAL NOT NULL DEFAULT 0.0,
        vibration_z REAL NOT NULL DEFAULT 0.0,
        \"current\" REAL NOT NULL DEFAULT 0.0,
        voltage REAL NOT NULL DEFAULT 0.0,
        power REAL NOT NULL DEFAULT 0.0,
        anomaly_score REAL NOT NULL,
        is_anomaly INTEGER NOT NULL,
        severity TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX IF NOT EXISTS idx_anomalies_timestamp ON anomalies(timestamp);";

/// Column names of `table`; empty when the table does not exist.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sensors (
            sensor_id TEXT PRIMARY KEY,
            sensor_type TEXT NOT NULL,
            location TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sensor_data (
            id INTEGER PRIMARY KEY,
            sensor_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            temperature REAL,
            humidity REAL,
            pressure REAL,
            vibration_x REAL,
            vibration_y REAL,
            vibration_z REAL,
            \"current\" REAL,
            voltage REAL,
            power REAL
        );

        CREATE TABLE IF NOT EXISTS detection_runs (
            id TEXT PRIMARY KEY,
            batch_size INTEGER NOT NULL,
            features INTEGER NOT NULL,
            contamination REAL NOT NULL,
            seed INTEGER NOT NULL,
            n_trees INTEGER NOT NULL,
            anomalies INTEGER NOT NULL,
            persisted INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sensor_data_timestamp ON sensor_data(timestamp);
        CREATE INDEX IF NOT EXISTS idx_detection_runs_started ON detection_runs(started_at);",
    )?;

    // Migration: an anomalies table from an older layout is dropped and rebuilt.
    let existing = table_columns(conn, "anomalies")?;
    if !existing.is_empty() {
        let missing: Vec<&str> = ANOMALY_COLUMNS
            .iter()
            .copied()
            .filter(|col| !existing.iter().any(|e| e == col))
            .collect();
        if !missing.is_empty() {
            warn!(?missing, "anomalies table is missing required columns, recreating it");
            conn.execute("DROP TABLE anomalies", [])?;
        }
    }
    conn.execute_batch(CREATE_ANOMALIES)?;

    let has_unique: bool = conn.query_row(
        "SELECT count(*) FROM pragma_index_list('anomalies') WHERE name = 'idx_anomalies_reading'",
        [],
        |row| row.get::<_, i64>(0).map(|n| n > 0),
    )?;
    if !has_unique {
        let removed = conn.execute(
            "DELETE FROM anomalies WHERE id NOT IN (
                SELECT MIN(id) FROM anomalies GROUP BY sensor_id, timestamp
            )",
            [],
        )?;
        if removed > 0 {
            warn!(removed, "collapsed duplicate anomaly rows");
        }
        conn.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_anomalies_reading ON anomalies(sensor_id, timestamp);",
        )?;
    }

    Ok(())
}
