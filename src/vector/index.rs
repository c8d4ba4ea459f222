//! Vector index contract and the exact flat index

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EddyError, Result};

use super::{normalize, DistanceMetric};

/// One scored search hit; score is a similarity in `[0, 1]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredId {
    pub id: String,
    pub score: f32,
}

/// Dense-vector nearest-neighbor index
pub trait VectorIndex: Send + Sync {
    /// Insert or replace one vector
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()>;

    fn remove(&mut self, id: &str) -> bool;

    /// `k` nearest ids, best first. A filter is applied before scoring
    /// when [`VectorIndex::supports_prefilter`] holds, after the
    /// candidate walk otherwise.
    fn search(&self, query: &[f32], k: usize, filter: Option<&dyn Fn(&str) -> bool>)
        -> Vec<ScoredId>;

    fn supports_prefilter(&self) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

/// Stored form of one vector; quantized entries trade precision for a
/// quarter of the memory
#[derive(Debug, Clone, Serialize, Deserialize)]
enum StoredVector {
    Full(Vec<f32>),
    Quantized {
        min: f32,
        max: f32,
        codes: Vec<u8>,
    },
}

impl StoredVector {
    fn encode(vector: &[f32], quantize: bool) -> Self {
        if !quantize {
            return StoredVector::Full(vector.to_vec());
        }
        let min = vector.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = vector.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let span = (max - min).max(f32::EPSILON);
        let codes = vector
            .iter()
            .map(|v| (((v - min) / span) * 255.0).round() as u8)
            .collect();
        StoredVector::Quantized { min, max, codes }
    }

    fn decode(&self) -> Vec<f32> {
        match self {
            StoredVector::Full(v) => v.clone(),
            StoredVector::Quantized { min, max, codes } => {
                let span = (max - min).max(f32::EPSILON);
                codes
                    .iter()
                    .map(|&c| min + (c as f32 / 255.0) * span)
                    .collect()
            }
        }
    }
}

/// Brute-force exact index. Scans every stored vector per query and
/// honors pre-filtering, so filtered searches never lose recall.
pub struct FlatIndex {
    metric: DistanceMetric,
    dimensions: usize,
    quantize: bool,
    vectors: HashMap<String, StoredVector>,
}

impl FlatIndex {
    pub fn new(dimensions: usize, metric: DistanceMetric) -> Self {
        Self {
            metric,
            dimensions,
            quantize: false,
            vectors: HashMap::new(),
        }
    }

    /// Store vectors scalar-quantized to one byte per dimension
    pub fn quantized(dimensions: usize, metric: DistanceMetric) -> Self {
        Self {
            quantize: true,
            ..Self::new(dimensions, metric)
        }
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(EddyError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }
}

impl VectorIndex for FlatIndex {
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        self.check_dimensions(vector)?;
        let vector = if self.metric.normalizes() {
            normalize(vector)
        } else {
            vector.to_vec()
        };
        self.vectors
            .insert(id.to_string(), StoredVector::encode(&vector, self.quantize));
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        self.vectors.remove(id).is_some()
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> Vec<ScoredId> {
        if query.len() != self.dimensions || k == 0 {
            return Vec::new();
        }
        let query = if self.metric.normalizes() {
            normalize(query)
        } else {
            query.to_vec()
        };

        let mut scored: Vec<(f32, &String)> = self
            .vectors
            .iter()
            .filter(|(id, _)| filter.map(|f| f(id)).unwrap_or(true))
            .map(|(id, stored)| (self.metric.distance(&query, &stored.decode()), id))
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(k)
            .map(|(distance, id)| ScoredId {
                id: id.clone(),
                score: self.metric.similarity(distance),
            })
            .collect()
    }

    fn supports_prefilter(&self) -> bool {
        true
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn clear(&mut self) {
        self.vectors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn exact_search_ranks_by_similarity() {
        let mut index = FlatIndex::new(4, DistanceMetric::Cosine);
        for axis in 0..4 {
            index.add(&format!("v{axis}"), &basis(4, axis)).unwrap();
        }
        let hits = index.search(&[1.0, 0.1, 0.0, 0.0], 2, None);
        assert_eq!(hits[0].id, "v0");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn dimension_mismatch_is_typed() {
        let mut index = FlatIndex::new(4, DistanceMetric::Cosine);
        let err = index.add("v", &[1.0, 2.0]).unwrap_err();
        assert_eq!(err.code(), "E_INVALID_ARGUMENT");
    }

    #[test]
    fn prefilter_excludes_before_scoring() {
        let mut index = FlatIndex::new(2, DistanceMetric::Euclidean);
        index.add("near", &[0.0, 0.0]).unwrap();
        index.add("far", &[5.0, 5.0]).unwrap();

        let only_far = |id: &str| id == "far";
        let hits = index.search(&[0.0, 0.0], 1, Some(&only_far));
        assert_eq!(hits[0].id, "far");
    }

    #[test]
    fn replace_keeps_one_entry_per_id() {
        let mut index = FlatIndex::new(2, DistanceMetric::Euclidean);
        index.add("v", &[0.0, 0.0]).unwrap();
        index.add("v", &[1.0, 1.0]).unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.remove("v"));
        assert!(index.is_empty());
    }

    #[test]
    fn quantized_search_stays_close_to_exact() {
        let mut exact = FlatIndex::new(8, DistanceMetric::Euclidean);
        let mut coarse = FlatIndex::quantized(8, DistanceMetric::Euclidean);
        let vectors: Vec<Vec<f32>> = (0..16)
            .map(|i| (0..8).map(|d| ((i * 8 + d) % 7) as f32).collect())
            .collect();
        for (i, v) in vectors.iter().enumerate() {
            exact.add(&format!("v{i}"), v).unwrap();
            coarse.add(&format!("v{i}"), v).unwrap();
        }
        let query = &vectors[3];
        let exact_top = &exact.search(query, 1, None)[0];
        let coarse_top = &coarse.search(query, 1, None)[0];
        assert_eq!(exact_top.id, coarse_top.id);
    }
}
