use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sensorguard::config::AppConfig;
use sensorguard::detect::Severity;
use sensorguard::pipeline::{ModelSnapshot, PersistencePolicy};
use sensorguard::simulate::{default_profiles, Simulator};
use sensorguard::storage;

#[derive(Parser)]
#[command(
    name = "sensorguard",
    about = "Unsupervised anomaly detection for industrial IoT sensor readings",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (otherwise $SENSORGUARD_CONFIG, then /etc/sensorguard/sensorguard.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path, overrides the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the database schema
    InitDb,

    /// Write synthetic sensor readings
    Simulate {
        /// Hours of history to backfill
        #[arg(long)]
        history_hours: Option<u32>,

        /// Keep emitting live readings until interrupted
        #[arg(long)]
        follow: bool,

        /// Seed for reproducible readings
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Score the trailing window once and persist the anomalies
    Detect {
        /// Size of the trailing window in hours
        #[arg(long)]
        hours_back: Option<u32>,

        /// Expected anomaly fraction, in (0, 0.5]
        #[arg(long)]
        contamination: Option<f64>,

        /// Persist every scored reading, not just anomalies
        #[arg(long)]
        persist_all: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Write the fitted model and scaling to this file
        #[arg(long)]
        save_model: Option<PathBuf>,

        /// Score with a model saved by --save-model instead of fitting one
        #[arg(long)]
        model: Option<PathBuf>,
    },

    /// Run detection periodically until interrupted
    Watch {
        /// Seconds between runs
        #[arg(long)]
        interval: Option<u64>,
    },

    /// List recently persisted anomalies
    Anomalies {
        /// Maximum rows to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Size of the trailing window in hours
        #[arg(long)]
        hours_back: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List recent detection runs
    Runs {
        /// Maximum rows to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }
    init_logging(&config);

    match cli.command {
        Commands::InitDb => {
            sensorguard::open_storage(&config)?;
            println!("Database ready at {}", config.storage.db_path.display());
        }
        Commands::Simulate {
            history_hours,
            follow,
            seed,
        } => {
            if let Some(h) = history_hours {
                config.simulator.history_hours = h;
            }
            if seed.is_some() {
                config.simulator.seed = seed;
            }
            let pool = sensorguard::open_storage(&config)?;
            let mut simulator = Simulator::new(default_profiles(), &config.simulator);
            let written = sensorguard::seed_history(&pool, &mut simulator, &config)?;
            println!("Wrote {} readings ({} hours of history).", written, config.simulator.history_hours);

            if follow {
                tracing::info!(interval_secs = config.simulator.interval_secs, "following live");
                let ticks = sensorguard::follow(pool, simulator, config, None).await?;
                println!("Stopped after {} ticks.", ticks);
            }
        }
        Commands::Detect {
            hours_back,
            contamination,
            persist_all,
            json,
            save_model,
            model,
        } => {
            if let Some(h) = hours_back {
                config.detection.hours_back = h;
            }
            if let Some(c) = contamination {
                config.detection.contamination = c;
            }
            if persist_all {
                config.detection.persist = PersistencePolicy::All;
            }
            config.validate()?;

            let snapshot = match &model {
                Some(path) => {
                    let json = std::fs::read_to_string(path)
                        .with_context(|| format!("failed to read model from {}", path.display()))?;
                    let snapshot = ModelSnapshot::from_json(&json)
                        .with_context(|| format!("failed to load model from {}", path.display()))?;
                    tracing::info!(path = %path.display(), trees = snapshot.model.n_trees(), "loaded model");
                    Some(snapshot)
                }
                None => None,
            };

            let pool = sensorguard::open_storage(&config)?;
            let Some((report, detection)) = sensorguard::run_detection_with(&pool, &config, snapshot.as_ref())? else {
                println!("No readings in the last {} hours.", config.detection.hours_back);
                return Ok(());
            };

            if let Some(path) = save_model {
                match detection.snapshot() {
                    Some(snapshot) => {
                        std::fs::write(&path, snapshot.to_json()?)
                            .with_context(|| format!("failed to write model to {}", path.display()))?;
                        tracing::info!(path = %path.display(), "saved model");
                    }
                    None => tracing::warn!("batch too small to fit a model, nothing saved"),
                }
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let s = &report.summary;
                println!("\n=== Detection Run {} ===", report.run_id);
                println!("Readings:   {}", s.total);
                println!("Anomalies:  {} ({:.1}%)", s.anomalies, s.anomaly_rate);
                for severity in Severity::ALL {
                    let n = s.by_severity.get(&severity).copied().unwrap_or(0);
                    println!("  {:<10} {}", severity, n);
                }
                println!("Persisted:  {}", report.persisted());
                if report.failed() > 0 {
                    println!("Failed:     {}", report.failed());
                }
                println!();
            }
        }
        Commands::Watch { interval } => {
            if let Some(secs) = interval {
                config.watch.interval_secs = secs;
            }
            config.validate()?;
            let pool = sensorguard::open_storage(&config)?;
            sensorguard::watch(pool, config, None).await?;
        }
        Commands::Anomalies {
            limit,
            hours_back,
            json,
        } => {
            let hours_back = hours_back.unwrap_or(config.detection.hours_back);
            let pool = sensorguard::open_storage(&config)?;
            let conn = pool.get()?;
            let rows = storage::list_recent_anomalies(&conn, limit, hours_back)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No anomalies in the last {} hours.", hours_back);
            } else {
                println!("{:<24} | {:<10} | {:<8} | {:>8}", "Timestamp", "Sensor", "Severity", "Score");
                println!("{:-<24}-|-{:-<10}-|-{:-<8}-|-{:-<8}", "", "", "", "");
                for r in &rows {
                    let ts = r.timestamp.as_ref().map(storage::format_ts).unwrap_or_default();
                    println!(
                        "{:<24} | {:<10} | {:<8} | {:>8.4}",
                        ts, r.sensor_id, r.severity, r.anomaly_score
                    );
                }

                let counts = storage::severity_counts(&conn, hours_back)?;
                let line: Vec<String> = counts.iter().map(|(s, n)| format!("{s}={n}")).collect();
                println!("\nBy severity: {}", line.join(" "));
            }
        }
        Commands::Runs { limit } => {
            let pool = sensorguard::open_storage(&config)?;
            let conn = pool.get()?;
            let runs = storage::list_runs(&conn, limit)?;
            if runs.is_empty() {
                println!("No detection runs recorded.");
            } else {
                println!("{:<36} | {:<24} | {:>6} | {:>9} | {:>9}", "Run", "Started", "Batch", "Anomalies", "Persisted");
                println!("{:-<36}-|-{:-<24}-|-{:-<6}-|-{:-<9}-|-{:-<9}", "", "", "", "", "");
                for r in runs {
                    println!(
                        "{:<36} | {:<24} | {:>6} | {:>9} | {:>9}",
                        r.id, r.started_at, r.batch_size, r.anomalies, r.persisted
                    );
                }
            }
        }
    }

    Ok(())
}
