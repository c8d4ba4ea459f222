//! Vector indexing and filtered similarity search

pub mod collection;
pub mod embedding;
pub mod hnsw;
pub mod index;
pub mod store;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Value;

pub use collection::{VectorCollection, VectorCollectionConfig};
pub use embedding::{EmbeddingCache, EmbeddingProvider, HashingEmbedder};
pub use hnsw::HnswIndex;
pub use index::{FlatIndex, ScoredId, VectorIndex};
pub use store::{
    BatchReport, SearchOptions, VectorChange, VectorInput, VectorMatch, VectorStore,
    VectorStoreConfig, VectorStoreStats,
};

/// Distance metric for vector comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    DotProduct,
}

impl DistanceMetric {
    /// Distance between two vectors; lower is closer. Cosine assumes
    /// unit-normalized inputs (1 - dot).
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => {
                1.0 - a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f32>()
            }
            DistanceMetric::Euclidean => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f32>()
                .sqrt(),
            DistanceMetric::DotProduct => {
                -a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f32>()
            }
        }
    }

    /// Map a distance to a similarity score in `[0, 1]`
    pub fn similarity(&self, distance: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => (1.0 - distance / 2.0).clamp(0.0, 1.0),
            DistanceMetric::Euclidean => 1.0 / (1.0 + distance.max(0.0)),
            // Distance is the negated dot product; squash through a
            // logistic so arbitrary magnitudes stay in range.
            DistanceMetric::DotProduct => 1.0 / (1.0 + distance.exp()),
        }
    }

    /// Whether vectors should be unit-normalized before indexing
    pub fn normalizes(&self) -> bool {
        matches!(self, DistanceMetric::Cosine)
    }
}

/// Normalize to unit length; zero vectors pass through unchanged
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter().map(|x| x / norm).collect()
    } else {
        vector.to_vec()
    }
}

/// A stored vector with its metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_distance_of_identical_unit_vectors_is_zero() {
        let v = normalize(&[3.0, 4.0]);
        let d = DistanceMetric::Cosine.distance(&v, &v);
        assert!(d.abs() < 1e-6);
        assert!((DistanceMetric::Cosine.similarity(d) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_stays_in_unit_interval() {
        for metric in [
            DistanceMetric::Cosine,
            DistanceMetric::Euclidean,
            DistanceMetric::DotProduct,
        ] {
            for distance in [-10.0, -1.0, 0.0, 0.5, 2.0, 100.0] {
                let score = metric.similarity(distance);
                assert!((0.0..=1.0).contains(&score), "{metric:?} {distance}");
            }
        }
    }

    #[test]
    fn zero_vector_normalizes_to_itself() {
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
