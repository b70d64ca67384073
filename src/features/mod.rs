//! Feature assembly: turning loosely-populated readings into fixed-length vectors.

pub mod normalize;

pub use normalize::{normalize, NormalizedVector, ScalingStats};

use crate::sensor::{Channel, SensorReading, CHANNEL_COUNT};

/// One value per channel, in canonical channel order, no gaps.
pub type FeatureVector = [f64; CHANNEL_COUNT];

/// Mean of the present values of each channel across the batch.
/// `None` when a channel is absent from every reading.
pub fn channel_means(readings: &[SensorReading]) -> [Option<f64>; CHANNEL_COUNT] {
    let mut sums = [0.0_f64; CHANNEL_COUNT];
    let mut counts = [0_usize; CHANNEL_COUNT];

    for reading in readings {
        for channel in Channel::ALL {
            if let Some(v) = reading.get(channel) {
                sums[channel.index()] += v;
                counts[channel.index()] += 1;
            }
        }
    }

    let mut means = [None; CHANNEL_COUNT];
    for i in 0..CHANNEL_COUNT {
        if counts[i] > 0 {
            means[i] = Some(sums[i] / counts[i] as f64);
        }
    }
    means
}

/// Build one feature vector per reading, filling absent values with the
/// batch mean of that channel (0.0 when the channel is absent everywhere).
pub fn assemble(readings: &[SensorReading]) -> Vec<FeatureVector> {
    let means = channel_means(readings);
    let mut fill = [0.0; CHANNEL_COUNT];
    for (slot, mean) in fill.iter_mut().zip(means) {
        *slot = mean.unwrap_or(0.0);
    }
    assemble_with_fill(readings, &fill)
}

/// Build feature vectors using caller-supplied fill values, e.g. the means
/// retained from a previous batch.
pub fn assemble_with_fill(readings: &[SensorReading], fill: &FeatureVector) -> Vec<FeatureVector> {
    readings
        .iter()
        .map(|reading| {
            let mut row = *fill;
            for channel in Channel::ALL {
                if let Some(v) = reading.get(channel) {
                    row[channel.index()] = v;
                }
            }
            row
        })
        .collect()
}
