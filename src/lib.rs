//! sensorguard -- unsupervised anomaly scoring for industrial IoT readings.
//!
//! Readings from temperature, vibration and power sensors are assembled into
//! fixed-width feature vectors, standardized, scored with an isolation forest
//! and graded into severity tiers. Flagged readings are appended to SQLite.

pub mod config;
pub mod detect;
pub mod features;
pub mod pipeline;
pub mod sensor;
pub mod simulate;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::pipeline::{BatchReport, Detection, ModelSnapshot, Pipeline};
use crate::simulate::Simulator;
use crate::storage::{Pool, SqliteSink};

/// Open the configured database, creating the schema if needed.
pub fn open_storage(config: &AppConfig) -> Result<Pool> {
    let path = config.storage.db_path.to_string_lossy();
    info!(db_path = %path, "opening database");
    storage::open_pool(&path)
}

/// Score the configured trailing window once and persist the result.
///
/// Returns `None` when the window holds no readings.
pub fn run_detection(pool: &Pool, config: &AppConfig) -> Result<Option<(BatchReport, Detection)>> {
    run_detection_with(pool, config, None)
}

/// Like [`run_detection`], scoring against `snapshot` instead of fitting a
/// fresh forest when one is given.
pub fn run_detection_with(
    pool: &Pool,
    config: &AppConfig,
    snapshot: Option<&ModelSnapshot>,
) -> Result<Option<(BatchReport, Detection)>> {
    let params = config.forest_params();
    let pipeline = Pipeline::new(params.clone(), config.detection.persist)?;

    let readings = {
        let conn = pool.get()?;
        storage::load_readings(&conn, config.detection.hours_back)?
    };
    if readings.is_empty() {
        info!(hours_back = config.detection.hours_back, "no readings in window");
        return Ok(None);
    }

    let mut sink = SqliteSink::new(pool.clone());
    let (report, detection) = match snapshot {
        Some(snap) => pipeline.run_with(&snap.model, &snap.scaling, &readings, &mut sink)?,
        None => pipeline.run_detailed(&readings, &mut sink)?,
    };

    let conn = pool.get()?;
    storage::record_run(&conn, &report, &params).context("failed to record detection run")?;
    Ok(Some((report, detection)))
}

/// Tally of a periodic loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: usize,
    pub failures: usize,
}

/// Run detection every `config.watch.interval_secs` until ctrl-c, or until
/// `max_ticks` runs have finished. A failed run is logged and the loop
/// carries on.
pub async fn watch(pool: Pool, config: AppConfig, max_ticks: Option<usize>) -> Result<LoopStats> {
    let period = Duration::from_secs(config.watch.interval_secs.max(1));
    info!(interval_secs = period.as_secs(), "watch loop started");

    let stats = run_periodic(period, max_ticks, move || {
        run_detection(&pool, &config).map(|run| run.map(|(report, _)| report))
    })
    .await;

    info!(ticks = stats.ticks, failures = stats.failures, "watch loop stopped");
    Ok(stats)
}

/// Call `job` on the blocking pool once per `period`. Ctrl-c is honoured
/// while waiting for a tick and while a job is running; an interrupted job
/// is left to finish on its own and is not counted.
async fn run_periodic<F>(period: Duration, max_ticks: Option<usize>, job: F) -> LoopStats
where
    F: Fn() -> Result<Option<BatchReport>> + Send + Sync + 'static,
{
    let job = Arc::new(job);
    let mut interval = tokio::time::interval(period);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stats = LoopStats::default();

    while max_ticks.map_or(true, |max| stats.ticks < max) {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut ctrl_c => break,
        }

        let job = Arc::clone(&job);
        let handle = tokio::task::spawn_blocking(move || (*job)());
        let outcome = tokio::select! {
            outcome = handle => outcome,
            _ = &mut ctrl_c => {
                info!("interrupted during a run");
                break;
            }
        };

        stats.ticks += 1;
        match outcome {
            Ok(Ok(Some(report))) if report.summary.anomalies > 0 => {
                warn!(
                    run_id = %report.run_id,
                    anomalies = report.summary.anomalies,
                    "anomalies detected"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                stats.failures += 1;
                warn!(error = %e, "detection run failed, will retry next tick");
            }
            Err(e) => {
                stats.failures += 1;
                error!(error = %e, "detection task panicked");
            }
        }
    }
    stats
}

/// Write `config.simulator.history_hours` of synthetic history. Returns the
/// number of readings written.
pub fn seed_history(pool: &Pool, simulator: &mut Simulator, config: &AppConfig) -> Result<usize> {
    let mut conn = pool.get()?;
    simulate::register_profiles(&conn, simulator.profiles())?;
    let readings = simulator.history(
        Utc::now(),
        config.simulator.history_hours,
        config.simulator.step_minutes,
    );
    let written = simulate::write_readings(&mut conn, &readings)?;
    info!(readings = written, hours = config.simulator.history_hours, "wrote simulated history");
    Ok(written)
}

/// Emit one live reading per sensor every `config.simulator.interval_secs`
/// until ctrl-c, or until `max_ticks` ticks have been written.
pub async fn follow(
    pool: Pool,
    mut simulator: Simulator,
    config: AppConfig,
    max_ticks: Option<usize>,
) -> Result<usize> {
    let period = Duration::from_secs(config.simulator.interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticks = 0usize;

    while max_ticks.map_or(true, |max| ticks < max) {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut ctrl_c => break,
        }

        let readings = simulator.tick(Utc::now());
        let pool = pool.clone();
        let handle = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut conn = pool.get()?;
            simulate::write_readings(&mut conn, &readings)
        });
        let written = tokio::select! {
            written = handle => written?,
            _ = &mut ctrl_c => break,
        };
        match written {
            Ok(n) => info!(readings = n, "wrote live readings"),
            Err(e) => warn!(error = %e, "failed to write live readings"),
        }
        ticks += 1;
    }
    info!(ticks, "simulator stopped");
    Ok(ticks)
}
