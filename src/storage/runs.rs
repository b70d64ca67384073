//! Detection run ledger.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use super::format_ts;
use crate::detect::ForestParams;
use crate::pipeline::BatchReport;
use crate::sensor::CHANNEL_COUNT;

/// One row of the `detection_runs` table.
#[derive(Debug, Clone, Serialize)]
pub struct RunRow {
    pub id: String,
    pub batch_size: i64,
    pub contamination: f64,
    pub anomalies: i64,
    pub persisted: i64,
    pub failed: i64,
    pub started_at: String,
}

pub fn record_run(conn: &Connection, report: &BatchReport, params: &ForestParams) -> Result<()> {
    conn.execute(
        "INSERT INTO detection_runs (
            id, batch_size, features, contamination, seed, n_trees,
            anomalies, persisted, failed, started_at, finished_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            report.run_id.to_string(),
            report.summary.total as i64,
            CHANNEL_COUNT as i64,
            params.contamination,
            params.seed as i64,
            params.n_trees as i64,
            report.summary.anomalies as i64,
            report.persisted() as i64,
            report.failed() as i64,
            format_ts(&report.started_at),
            format_ts(&report.finished_at)
        ],
    )?;
    Ok(())
}

pub fn list_runs(conn: &Connection, limit: usize) -> Result<Vec<RunRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, batch_size, contamination, anomalies, persisted, failed, started_at
         FROM detection_runs ORDER BY started_at DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(RunRow {
                id: row.get(0)?,
                batch_size: row.get(1)?,
                contamination: row.get(2)?,
                anomalies: row.get(3)?,
                persisted: row.get(4)?,
                failed: row.get(5)?,
                started_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
