//! HNSW approximate nearest-neighbor index
//!
//! Hierarchical graph search: a greedy descent through the upper layers
//! narrows the entry point, then a beam search over layer 0 collects
//! candidates. Level assignment draws from a seeded generator so index
//! shape and results are reproducible run to run.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{EddyError, Result};

use super::index::{ScoredId, VectorIndex};
use super::{normalize, DistanceMetric};

const MAX_LEVEL: usize = 16;

/// HNSW construction and search parameters
#[derive(Debug, Clone)]
pub struct HnswParams {
    /// Max connections per node per layer (layer 0 doubles this)
    pub m: usize,
    /// Beam width while building
    pub ef_construction: usize,
    /// Beam width while searching
    pub ef_search: usize,
    /// Level-generator seed
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            seed: 42,
        }
    }
}

struct Node {
    vector: Vec<f32>,
    level: usize,
}

/// Hierarchical navigable small-world graph index
pub struct HnswIndex {
    metric: DistanceMetric,
    dimensions: usize,
    params: HnswParams,
    rng: StdRng,
    nodes: HashMap<String, Node>,
    /// Adjacency per layer; layer 0 is the densest
    layers: Vec<HashMap<String, Vec<String>>>,
    entry: Option<String>,
}

impl HnswIndex {
    pub fn new(dimensions: usize, metric: DistanceMetric, params: HnswParams) -> Self {
        Self {
            metric,
            dimensions,
            rng: StdRng::seed_from_u64(params.seed),
            params,
            nodes: HashMap::new(),
            layers: vec![HashMap::new()],
            entry: None,
        }
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        self.metric.distance(a, b)
    }

    fn vector_of(&self, id: &str) -> Option<&[f32]> {
        self.nodes.get(id).map(|n| n.vector.as_slice())
    }

    /// Geometric level draw with ml = 1/ln(M)
    fn random_level(&mut self) -> usize {
        let ml = 1.0 / (self.params.m as f64).ln();
        let uniform: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        ((-uniform.ln() * ml).floor() as usize).min(MAX_LEVEL)
    }

    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    /// Beam search within one layer, returning up to `ef` ids ordered by
    /// ascending distance
    fn search_layer(&self, entry: &str, query: &[f32], ef: usize, layer: usize) -> Vec<String> {
        let Some(entry_vector) = self.vector_of(entry) else {
            return Vec::new();
        };
        let Some(adjacency) = self.layers.get(layer) else {
            return Vec::new();
        };

        let entry_distance = self.distance(query, entry_vector);
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(entry);

        // Min-heap of candidates to expand, max-heap of the best found.
        let mut candidates = BinaryHeap::new();
        candidates.push(Reverse(Scored(entry_distance, entry.to_string())));
        let mut best = BinaryHeap::new();
        best.push(Scored(entry_distance, entry.to_string()));

        while let Some(Reverse(Scored(distance, id))) = candidates.pop() {
            let worst = best.peek().map(|s: &Scored| s.0).unwrap_or(f32::MAX);
            if distance > worst && best.len() >= ef {
                break;
            }
            let Some(neighbors) = adjacency.get(&id) else {
                continue;
            };
            for neighbor in neighbors {
                if !visited.insert(neighbor.as_str()) {
                    continue;
                }
                let Some(vector) = self.vector_of(neighbor) else {
                    continue;
                };
                let d = self.distance(query, vector);
                let worst = best.peek().map(|s: &Scored| s.0).unwrap_or(f32::MAX);
                if best.len() < ef || d < worst {
                    candidates.push(Reverse(Scored(d, neighbor.clone())));
                    best.push(Scored(d, neighbor.clone()));
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        best.into_sorted_vec().into_iter().map(|s| s.1).collect()
    }

    /// Greedy single-step descent from the top layer down to `floor + 1`
    fn descend(&self, query: &[f32], floor: usize) -> Option<String> {
        let mut current = self.entry.clone()?;
        let top = self.layers.len() - 1;
        for layer in ((floor + 1)..=top).rev() {
            if let Some(nearest) = self.search_layer(&current, query, 1, layer).into_iter().next()
            {
                current = nearest;
            }
        }
        Some(current)
    }

    fn link(&mut self, layer: usize, a: &str, b: &str) {
        let adjacency = &mut self.layers[layer];
        adjacency
            .entry(a.to_string())
            .or_default()
            .push(b.to_string());
        adjacency
            .entry(b.to_string())
            .or_default()
            .push(a.to_string());
    }

    /// Trim a node's neighbor list to the layer's connection budget,
    /// keeping the closest
    fn prune(&mut self, layer: usize, id: &str) {
        let budget = self.max_connections(layer);
        let Some(neighbors) = self.layers[layer].get(id).cloned() else {
            return;
        };
        if neighbors.len() <= budget {
            return;
        }
        let Some(vector) = self.vector_of(id).map(<[f32]>::to_vec) else {
            return;
        };
        let mut scored: Vec<(f32, String)> = neighbors
            .into_iter()
            .filter_map(|n| {
                self.vector_of(&n)
                    .map(|v| (self.distance(&vector, v), n.clone()))
            })
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(budget);
        self.layers[layer]
            .insert(id.to_string(), scored.into_iter().map(|(_, n)| n).collect());
    }
}

impl VectorIndex for HnswIndex {
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(EddyError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        if self.nodes.contains_key(id) {
            self.remove(id);
        }
        let vector = if self.metric.normalizes() {
            normalize(vector)
        } else {
            vector.to_vec()
        };

        let level = self.random_level();
        while self.layers.len() <= level {
            self.layers.push(HashMap::new());
        }
        self.nodes.insert(
            id.to_string(),
            Node {
                vector: vector.clone(),
                level,
            },
        );

        let Some(entry) = self.entry.clone() else {
            self.entry = Some(id.to_string());
            return Ok(());
        };
        let entry_level = self.nodes.get(&entry).map(|n| n.level).unwrap_or(0);

        let mut current = if entry_level > level {
            self.descend(&vector, level).unwrap_or(entry)
        } else {
            entry
        };

        for layer in (0..=level.min(entry_level)).rev() {
            let found =
                self.search_layer(&current, &vector, self.params.ef_construction, layer);
            if let Some(nearest) = found.first() {
                current = nearest.clone();
            }
            let budget = self.max_connections(layer);
            for neighbor in found.into_iter().take(budget) {
                self.link(layer, id, &neighbor);
            }
            self.prune(layer, id);
            let neighbors = self.layers[layer].get(id).cloned().unwrap_or_default();
            for neighbor in neighbors {
                self.prune(layer, &neighbor);
            }
        }

        if level > entry_level {
            self.entry = Some(id.to_string());
        }
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        if self.nodes.remove(id).is_none() {
            return false;
        }
        for adjacency in &mut self.layers {
            adjacency.remove(id);
            for neighbors in adjacency.values_mut() {
                neighbors.retain(|n| n != id);
            }
        }
        if self.entry.as_deref() == Some(id) {
            // Promote the highest remaining node.
            self.entry = self
                .nodes
                .iter()
                .max_by_key(|(_, node)| node.level)
                .map(|(id, _)| id.clone());
        }
        true
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn Fn(&str) -> bool>,
    ) -> Vec<ScoredId> {
        if query.len() != self.dimensions || k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }
        let query = if self.metric.normalizes() {
            normalize(query)
        } else {
            query.to_vec()
        };

        let Some(entry) = self.descend(&query, 0) else {
            return Vec::new();
        };
        let ef = self.params.ef_search.max(k);
        let found = self.search_layer(&entry, &query, ef, 0);

        // The graph cannot pre-filter; drop non-matching ids afterwards.
        found
            .into_iter()
            .filter(|id| filter.map(|f| f(id)).unwrap_or(true))
            .take(k)
            .filter_map(|id| {
                self.vector_of(&id).map(|v| ScoredId {
                    score: self.metric.similarity(self.distance(&query, v)),
                    id,
                })
            })
            .collect()
    }

    fn supports_prefilter(&self) -> bool {
        false
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.layers = vec![HashMap::new()];
        self.entry = None;
        self.rng = StdRng::seed_from_u64(self.params.seed);
    }
}

/// Distance-ordered id for the heaps
#[derive(Clone)]
struct Scored(f32, String);

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0 && self.1 == other.1
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .partial_cmp(&other.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.1.cmp(&other.1))
    }
}
