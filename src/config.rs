//! TOML configuration for sensorguard.
//!
//! Every section has compiled-in defaults, so an empty file (or none at all)
//! is a valid configuration. The file is looked up via `--config`, then the
//! `SENSORGUARD_CONFIG` environment variable, then the system location.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::ForestParams;
use crate::pipeline::{PersistencePolicy, PipelineError};

pub const CONFIG_ENV: &str = "SENSORGUARD_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/sensorguard/sensorguard.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration in lookup order. An explicitly requested file
    /// must load; the environment and system locations fall through with a
    /// warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    /// Try, in order: `SENSORGUARD_CONFIG`, the system path, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{CONFIG_ENV} set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn forest_params(&self) -> ForestParams {
        let d = &self.detection;
        ForestParams {
            n_trees: d.n_trees,
            max_samples: d.max_samples,
            contamination: d.contamination,
            seed: d.seed,
            min_batch_size: d.min_batch_size,
        }
    }

    /// Reject detection settings the forest cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.forest_params().validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/sensorguard.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Expected fraction of anomalies per batch, in (0, 0.5].
    pub contamination: f64,
    pub seed: u64,
    pub n_trees: usize,
    pub max_samples: usize,
    pub min_batch_size: usize,
    /// Size of the trailing window each run scores.
    pub hours_back: u32,
    pub persist: PersistencePolicy,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let p = ForestParams::default();
        Self {
            contamination: p.contamination,
            seed: p.seed,
            n_trees: p.n_trees,
            max_samples: p.max_samples,
            min_batch_size: p.min_batch_size,
            hours_back: 24,
            persist: PersistencePolicy::AnomaliesOnly,
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub history_hours: u32,
    pub step_minutes: u32,
    /// Seconds between live ticks in follow mode.
    pub interval_secs: u64,
    pub anomaly_probability: f64,
    /// Fixed seed for reproducible output. Entropy-seeded when unset.
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            history_hours: 24,
            step_minutes: 5,
            interval_secs: 30,
            anomaly_probability: 0.05,
            seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
