//! Per-batch standardization (zero mean, unit population variance).

use serde::{Deserialize, Serialize};

use super::FeatureVector;
use crate::sensor::CHANNEL_COUNT;

/// A feature vector rescaled with [`ScalingStats`].
pub type NormalizedVector = [f64; CHANNEL_COUNT];

/// Relative tolerance below which a channel's spread is treated as zero.
const ZERO_STD_TOLERANCE: f64 = 1e-12;

/// Mean and population standard deviation of each channel.
///
/// Derived once per batch. Callers that want consistent scaling across
/// batches keep this value and pass it to [`ScalingStats::transform`]
/// instead of refitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingStats {
    pub means: [f64; CHANNEL_COUNT],
    pub stds: [f64; CHANNEL_COUNT],
}

impl ScalingStats {
    pub fn fit(rows: &[FeatureVector]) -> Self {
        let mut means = [0.0; CHANNEL_COUNT];
        let mut stds = [0.0; CHANNEL_COUNT];
        if rows.is_empty() {
            return Self { means, stds };
        }

        let n = rows.len() as f64;
        for row in rows {
            for (m, v) in means.iter_mut().zip(row) {
                *m += v;
            }
        }
        for m in means.iter_mut() {
            *m /= n;
        }

        for row in rows {
            for i in 0..CHANNEL_COUNT {
                stds[i] += (row[i] - means[i]).powi(2);
            }
        }
        for i in 0..CHANNEL_COUNT {
            let std = (stds[i] / n).sqrt();
            // Rounding noise on a constant column must not turn into unit variance.
            stds[i] = if std <= ZERO_STD_TOLERANCE * means[i].abs().max(1.0) {
                0.0
            } else {
                std
            };
        }

        Self { means, stds }
    }

    /// `(value - mean) / std`, or 0.0 for channels with no spread.
    pub fn transform_row(&self, row: &FeatureVector) -> NormalizedVector {
        let mut out = [0.0; CHANNEL_COUNT];
        for i in 0..CHANNEL_COUNT {
            if self.stds[i] > 0.0 {
                out[i] = (row[i] - self.means[i]) / self.stds[i];
            }
        }
        out
    }

    pub fn transform(&self, rows: &[FeatureVector]) -> Vec<NormalizedVector> {
        rows.iter().map(|row| self.transform_row(row)).collect()
    }
}

/// Fit scaling statistics on the batch and apply them to it.
pub fn normalize(rows: &[FeatureVector]) -> (Vec<NormalizedVector>, ScalingStats) {
    let stats = ScalingStats::fit(rows);
    (stats.transform(rows), stats)
}
