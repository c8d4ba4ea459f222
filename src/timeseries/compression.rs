//! Delta and run-length codecs for time-series columns
//!
//! Both codecs are exact roundtrips. Sizes are accounted in value units
//! rather than bytes: a raw point costs two units (timestamp + value), a
//! delta-encoded timestamp column costs one unit per point, and each RLE
//! run costs two units.

use serde::{Deserialize, Serialize};

/// Delta encode: first value as-is, then successive differences
pub fn delta_encode(values: &[i64]) -> Vec<i64> {
    let mut out = Vec::with_capacity(values.len());
    let mut prev = 0;
    for (i, &value) in values.iter().enumerate() {
        if i == 0 {
            out.push(value);
        } else {
            out.push(value - prev);
        }
        prev = value;
    }
    out
}

/// Invert [`delta_encode`]
pub fn delta_decode(deltas: &[i64]) -> Vec<i64> {
    let mut out = Vec::with_capacity(deltas.len());
    let mut acc = 0;
    for (i, &delta) in deltas.iter().enumerate() {
        acc = if i == 0 { delta } else { acc + delta };
        out.push(acc);
    }
    out
}

/// One run of consecutive equal values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub value: f64,
    pub count: u32,
}

/// Run-length encode consecutive equal values
pub fn rle_encode(values: &[f64]) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for &value in values {
        match runs.last_mut() {
            Some(run) if run.value.to_bits() == value.to_bits() && run.count < u32::MAX => {
                run.count += 1;
            }
            _ => runs.push(Run { value, count: 1 }),
        }
    }
    runs
}

/// Invert [`rle_encode`]
pub fn rle_decode(runs: &[Run]) -> Vec<f64> {
    let mut out = Vec::with_capacity(runs.iter().map(|r| r.count as usize).sum());
    for run in runs {
        out.extend(std::iter::repeat(run.value).take(run.count as usize));
    }
    out
}

/// Unit-based compression accounting for one batch of points
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompressionStats {
    pub raw_units: usize,
    pub compressed_units: usize,
}

impl CompressionStats {
    pub fn measure(timestamps: &[i64], values: &[f64]) -> Self {
        let raw_units = timestamps.len() * 2;
        let compressed_units = delta_encode(timestamps).len() + rle_encode(values).len() * 2;
        Self {
            raw_units,
            compressed_units,
        }
    }

    pub fn merge(self, other: CompressionStats) -> Self {
        Self {
            raw_units: self.raw_units + other.raw_units,
            compressed_units: self.compressed_units + other.compressed_units,
        }
    }

    /// compressed/raw; 1.0 for empty input
    pub fn ratio(&self) -> f64 {
        if self.raw_units == 0 {
            1.0
        } else {
            self.compressed_units as f64 / self.raw_units as f64
        }
    }
}
