//! Columnar time-series store
//!
//! Points live in fixed-interval partitions, each holding a
//! timestamp-sorted array. Range queries binary-search the overlapping
//! partitions; aggregation buckets relative to the query start. The
//! codecs in [`compression`] back the store's compression accounting.

pub mod compression;

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EddyError, Result};

pub use compression::{delta_decode, delta_encode, rle_decode, rle_encode, CompressionStats, Run};

/// One observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    pub timestamp: i64,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
}

impl TimePoint {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self {
            timestamp,
            value,
            tags: None,
        }
    }

    pub fn tagged(timestamp: i64, value: f64, tags: HashMap<String, String>) -> Self {
        Self {
            timestamp,
            value,
            tags: Some(tags),
        }
    }

    fn matches_tags(&self, filter: &HashMap<String, String>) -> bool {
        filter.iter().all(|(key, expected)| {
            self.tags
                .as_ref()
                .and_then(|tags| tags.get(key))
                .map(|actual| actual == expected)
                .unwrap_or(false)
        })
    }
}

/// Aggregation function over a bucket of values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Sum,
    Count,
    /// Nearest-rank percentile, `0 < p <= 100`
    Percentile(f64),
}

impl Aggregation {
    fn apply(&self, values: &mut Vec<f64>) -> f64 {
        match self {
            Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            Aggregation::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Count => values.len() as f64,
            Aggregation::Percentile(p) => {
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let rank = ((p / 100.0) * values.len() as f64).ceil() as usize;
                values[rank.clamp(1, values.len()) - 1]
            }
        }
    }
}

/// One aggregated bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub start: i64,
    pub value: f64,
    pub count: usize,
}

/// Partition metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub start: i64,
    pub end: i64,
    pub points: usize,
}

/// Store-wide statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeSeriesStats {
    pub points: usize,
    pub partitions: usize,
    pub earliest: Option<i64>,
    pub latest: Option<i64>,
    pub compression_ratio: f64,
}

struct Partition {
    start: i64,
    points: Vec<TimePoint>,
}

impl Partition {
    /// Index range of `[start, end]` within the sorted points
    fn bounds(&self, start: i64, end: i64) -> (usize, usize) {
        let lower = self.points.partition_point(|p| p.timestamp < start);
        let upper = self.points.partition_point(|p| p.timestamp <= end);
        (lower, upper)
    }
}

/// Time-partitioned columnar store
pub struct TimeSeriesStore {
    interval: i64,
    partitions: RwLock<BTreeMap<i64, Partition>>,
}

impl TimeSeriesStore {
    pub fn new(interval: i64) -> Result<Self> {
        if interval <= 0 {
            return Err(EddyError::InvalidArgument(
                "partition interval must be positive".to_string(),
            ));
        }
        Ok(Self {
            interval,
            partitions: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    fn partition_key(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.interval) * self.interval
    }

    /// Insert one point at its sorted position in the owning partition
    pub fn ingest(&self, point: TimePoint) {
        let key = self.partition_key(point.timestamp);
        let mut partitions = self.partitions.write();
        let partition = partitions.entry(key).or_insert_with(|| Partition {
            start: key,
            points: Vec::new(),
        });
        let index = partition
            .points
            .partition_point(|p| p.timestamp <= point.timestamp);
        partition.points.insert(index, point);
    }

    pub fn ingest_batch(&self, points: Vec<TimePoint>) {
        for point in points {
            self.ingest(point);
        }
    }

    /// All points in `[start, end]`, tag-filtered, in timestamp order
    pub fn query_range(
        &self,
        start: i64,
        end: i64,
        tags: Option<&HashMap<String, String>>,
    ) -> Vec<TimePoint> {
        if end < start {
            return Vec::new();
        }
        let first_key = self.partition_key(start);
        let partitions = self.partitions.read();
        let mut out = Vec::new();
        // Partitions are disjoint and ordered, so per-partition slices
        // concatenate already sorted.
        for partition in partitions.range(first_key..=end).map(|(_, p)| p) {
            let (lower, upper) = partition.bounds(start, end);
            for point in &partition.points[lower..upper] {
                if tags.map(|t| point.matches_tags(t)).unwrap_or(true) {
                    out.push(point.clone());
                }
            }
        }
        out
    }

    /// Bucketed aggregation over `[start, end]`. Without a bucket width
    /// the whole range is one bucket; empty buckets are omitted.
    pub fn aggregate_range(
        &self,
        start: i64,
        end: i64,
        aggregation: Aggregation,
        bucket: Option<i64>,
    ) -> Result<Vec<AggregateBucket>> {
        if let Some(width) = bucket {
            if width <= 0 {
                return Err(EddyError::InvalidArgument(
                    "bucket width must be positive".to_string(),
                ));
            }
        }
        if let Aggregation::Percentile(p) = aggregation {
            if !(0.0..=100.0).contains(&p) || p == 0.0 {
                return Err(EddyError::InvalidArgument(format!(
                    "percentile out of range: {p}"
                )));
            }
        }

        let points = self.query_range(start, end, None);
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let width = bucket.unwrap_or(end.saturating_sub(start).max(1));

        let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for point in points {
            let offset = (point.timestamp - start).div_euclid(width);
            let bucket_start = start + offset * width;
            buckets.entry(bucket_start).or_default().push(point.value);
        }

        Ok(buckets
            .into_iter()
            .map(|(bucket_start, mut values)| AggregateBucket {
                start: bucket_start,
                count: values.len(),
                value: aggregation.apply(&mut values),
            })
            .collect())
    }

    pub fn get_partitions(&self) -> Vec<PartitionInfo> {
        self.partitions
            .read()
            .values()
            .map(|p| PartitionInfo {
                start: p.start,
                end: p.start + self.interval,
                points: p.points.len(),
            })
            .collect()
    }

    pub fn stats(&self) -> TimeSeriesStats {
        let partitions = self.partitions.read();
        let points = partitions.values().map(|p| p.points.len()).sum();
        let mut compression = CompressionStats::default();
        for partition in partitions.values() {
            let timestamps: Vec<i64> =
                partition.points.iter().map(|p| p.timestamp).collect();
            let values: Vec<f64> = partition.points.iter().map(|p| p.value).collect();
            compression = compression.merge(CompressionStats::measure(&timestamps, &values));
        }
        TimeSeriesStats {
            points,
            partitions: partitions.len(),
            earliest: partitions
                .values()
                .next()
                .and_then(|p| p.points.first())
                .map(|p| p.timestamp),
            latest: partitions
                .values()
                .last()
                .and_then(|p| p.points.last())
                .map(|p| p.timestamp),
            compression_ratio: compression.ratio(),
        }
    }

    /// Drop partitions whose end lies at or before `cutoff`
    pub fn drop_before(&self, cutoff: i64) -> usize {
        let mut partitions = self.partitions.write();
        let doomed: Vec<i64> = partitions
            .iter()
            .filter(|(_, p)| p.start + self.interval <= cutoff)
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            partitions.remove(key);
        }
        if !doomed.is_empty() {
            debug!(dropped = doomed.len(), cutoff, "expired partitions dropped");
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.partitions.write().clear();
    }
}

/// One tier of a retention hierarchy
pub struct TierConfig {
    /// Points older than this are expired out of the tier
    pub max_age: i64,
    /// When expiring, downsample into the next tier with this bucket
    /// width and aggregation; the last tier ages out without one
    pub downsample: Option<(i64, Aggregation)>,
}

struct Tier {
    store: TimeSeriesStore,
    config: TierConfig,
}

/// Raw-to-coarse retention hierarchy: ingest lands in the first tier and
/// expired partitions downsample into the next tier before aging out
pub struct TieredStore {
    tiers: Vec<Tier>,
}

impl TieredStore {
    pub fn new(tiers: Vec<(i64, TierConfig)>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(EddyError::InvalidArgument(
                "at least one tier is required".to_string(),
            ));
        }
        let tiers = tiers
            .into_iter()
            .map(|(interval, config)| {
                Ok(Tier {
                    store: TimeSeriesStore::new(interval)?,
                    config,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tiers })
    }

    pub fn ingest(&self, point: TimePoint) {
        self.tiers[0].store.ingest(point);
    }

    pub fn tier(&self, index: usize) -> Option<&TimeSeriesStore> {
        self.tiers.get(index).map(|t| &t.store)
    }

    /// Expire each tier against `now`, downsampling into the next tier
    /// where configured
    pub fn enforce(&self, now: i64) -> Result<()> {
        for index in 0..self.tiers.len() {
            let tier = &self.tiers[index];
            let cutoff = now - tier.config.max_age;

            if let Some((bucket, aggregation)) = tier.config.downsample {
                if let Some(next) = self.tiers.get(index + 1) {
                    // Only whole partitions expire; aggregate exactly what
                    // drop_before will remove.
                    let expiring: Vec<PartitionInfo> = tier
                        .store
                        .get_partitions()
                        .into_iter()
                        .filter(|p| p.end <= cutoff)
                        .collect();
                    for info in expiring {
                        let aggregated = tier.store.aggregate_range(
                            info.start,
                            info.end - 1,
                            aggregation,
                            Some(bucket),
                        )?;
                        for row in aggregated {
                            next.store.ingest(TimePoint::new(row.start, row.value));
                        }
                    }
                }
            }
            tier.store.drop_before(cutoff);
        }
        Ok(())
    }
}
