//! Vector store: entries, index maintenance, embedding and search

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{EddyError, Result};
use crate::query::Filter;
use crate::types::{now_millis, Document, Value};

use super::embedding::{EmbeddingCache, EmbeddingProvider};
use super::hnsw::{HnswIndex, HnswParams};
use super::index::{FlatIndex, VectorIndex};
use super::{DistanceMetric, VectorEntry};

/// Index selection
#[derive(Debug, Clone)]
pub enum IndexConfig {
    /// Exact scan; optionally scalar-quantized storage
    Flat { quantized: bool },
    /// Approximate hierarchical graph
    Hnsw(HnswParams),
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig::Flat { quantized: false }
    }
}

/// Vector store configuration
#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    pub dimensions: usize,
    pub metric: DistanceMetric,
    pub index: IndexConfig,
    /// FIFO capacity of the text→vector cache
    pub embed_cache_capacity: usize,
}

impl VectorStoreConfig {
    pub fn flat(dimensions: usize) -> Self {
        Self {
            dimensions,
            metric: DistanceMetric::Cosine,
            index: IndexConfig::default(),
            embed_cache_capacity: 1024,
        }
    }

    pub fn hnsw(dimensions: usize, params: HnswParams) -> Self {
        Self {
            dimensions,
            metric: DistanceMetric::Cosine,
            index: IndexConfig::Hnsw(params),
            embed_cache_capacity: 1024,
        }
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    fn build_index(&self) -> Box<dyn VectorIndex> {
        match &self.index {
            IndexConfig::Flat { quantized: false } => {
                Box::new(FlatIndex::new(self.dimensions, self.metric))
            }
            IndexConfig::Flat { quantized: true } => {
                Box::new(FlatIndex::quantized(self.dimensions, self.metric))
            }
            IndexConfig::Hnsw(params) => Box::new(HnswIndex::new(
                self.dimensions,
                self.metric,
                params.clone(),
            )),
        }
    }
}

/// Vector source for an upsert or search
#[derive(Debug, Clone)]
pub enum VectorInput {
    Vector(Vec<f32>),
    /// Embedded through the configured provider
    Text(String),
}

/// Store-level change events
#[derive(Debug, Clone)]
pub enum VectorChange {
    Added { id: String },
    Updated { id: String },
    Removed { id: String },
}

/// One search hit
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub metadata: Option<HashMap<String, Value>>,
    pub text: Option<String>,
}

/// Search parameters
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: usize,
    /// Metadata predicate, same tree as document query filters
    pub filter: Option<Filter>,
    pub min_score: Option<f32>,
}

impl SearchOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

/// One item of a batch upsert
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub id: String,
    pub input: VectorInput,
    pub metadata: Option<HashMap<String, Value>>,
}

/// Per-id outcome of a batch upsert
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Store statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreStats {
    pub entries: usize,
    pub indexed: usize,
    pub dimensions: usize,
    pub metric: DistanceMetric,
    pub cached_embeddings: usize,
}

/// Dense-vector store with a pluggable index and optional text embedding
pub struct VectorStore {
    config: VectorStoreConfig,
    entries: RwLock<HashMap<String, VectorEntry>>,
    index: RwLock<Box<dyn VectorIndex>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    cache: Mutex<EmbeddingCache>,
    events: broadcast::Sender<VectorChange>,
}

impl VectorStore {
    pub fn new(config: VectorStoreConfig) -> Self {
        let index = config.build_index();
        let cache = EmbeddingCache::new(config.embed_cache_capacity);
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            index: RwLock::new(index),
            embedder: None,
            cache: Mutex::new(cache),
            events,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    pub fn changes(&self) -> broadcast::Receiver<VectorChange> {
        self.events.subscribe()
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimensions {
            return Err(EddyError::DimensionMismatch {
                expected: self.config.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Resolve an input to a vector, embedding text through the cache
    async fn resolve(&self, input: &VectorInput) -> Result<(Vec<f32>, Option<String>)> {
        match input {
            VectorInput::Vector(vector) => {
                self.check_dimensions(vector)?;
                Ok((vector.clone(), None))
            }
            VectorInput::Text(text) => {
                if let Some(hit) = self.cache.lock().get(text) {
                    return Ok((hit.clone(), Some(text.clone())));
                }
                let embedder = self.embedder.as_ref().ok_or_else(|| {
                    EddyError::Embedding("no embedding provider configured".to_string())
                })?;
                let vector = embedder.embed(text).await?;
                self.check_dimensions(&vector)?;
                self.cache.lock().insert(text.clone(), vector.clone());
                Ok((vector, Some(text.clone())))
            }
        }
    }

    /// Insert or replace one entry
    pub async fn upsert(
        &self,
        id: &str,
        input: VectorInput,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<VectorEntry> {
        let (vector, text) = self.resolve(&input).await?;

        let now = now_millis();
        let mut entries = self.entries.write();
        let existing = entries.get(id);
        let entry = VectorEntry {
            id: id.to_string(),
            vector: vector.clone(),
            metadata,
            text,
            created_at: existing.map(|e| e.created_at).unwrap_or(now),
            updated_at: now,
        };
        let update = existing.is_some();
        self.index.write().add(id, &vector)?;
        entries.insert(id.to_string(), entry.clone());
        drop(entries);

        let _ = self.events.send(if update {
            VectorChange::Updated { id: id.to_string() }
        } else {
            VectorChange::Added { id: id.to_string() }
        });
        Ok(entry)
    }

    /// Batch upsert; text inputs coalesce into one `embed_batch` call and
    /// failures are recorded per id
    pub async fn upsert_batch(&self, items: Vec<BatchItem>) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        // Embed every uncached text in one provider round-trip.
        let mut pending: Vec<String> = Vec::new();
        for item in &items {
            if let VectorInput::Text(text) = &item.input {
                let cached = self.cache.lock().get(text).is_some();
                if !cached && !pending.contains(text) {
                    pending.push(text.clone());
                }
            }
        }
        if !pending.is_empty() {
            match self.embedder.as_ref() {
                None => {
                    for item in items
                        .iter()
                        .filter(|i| matches!(i.input, VectorInput::Text(_)))
                    {
                        report
                            .failed
                            .push((item.id.clone(), "no embedding provider configured".into()));
                    }
                    let vector_items: Vec<BatchItem> = items
                        .into_iter()
                        .filter(|i| matches!(i.input, VectorInput::Vector(_)))
                        .collect();
                    self.apply_batch(vector_items, &mut report).await;
                    return Ok(report);
                }
                Some(embedder) => match embedder.embed_batch(&pending).await {
                    Ok(vectors) => {
                        let mut cache = self.cache.lock();
                        for (text, vector) in pending.iter().zip(vectors) {
                            cache.insert(text.clone(), vector);
                        }
                    }
                    Err(e) => {
                        // The provider failed wholesale; every text item
                        // shares the error.
                        for item in items
                            .iter()
                            .filter(|i| matches!(i.input, VectorInput::Text(_)))
                        {
                            report.failed.push((item.id.clone(), e.to_string()));
                        }
                        let vector_items: Vec<BatchItem> = items
                            .into_iter()
                            .filter(|i| matches!(i.input, VectorInput::Vector(_)))
                            .collect();
                        self.apply_batch(vector_items, &mut report).await;
                        return Ok(report);
                    }
                },
            }
        }

        self.apply_batch(items, &mut report).await;
        Ok(report)
    }

    async fn apply_batch(&self, items: Vec<BatchItem>, report: &mut BatchReport) {
        for item in items {
            match self.upsert(&item.id, item.input, item.metadata).await {
                Ok(_) => report.succeeded.push(item.id),
                Err(e) => report.failed.push((item.id, e.to_string())),
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<VectorEntry> {
        self.entries.read().get(id).cloned()
    }

    pub fn delete(&self, id: &str) -> bool {
        let removed = self.entries.write().remove(id).is_some();
        if removed {
            self.index.write().remove(id);
            let _ = self.events.send(VectorChange::Removed { id: id.to_string() });
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.write().clear();
        self.index.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Search by text or pre-computed vector. The index over-fetches
    /// `2 × limit` candidates; the metadata filter applies during scoring
    /// when the index can pre-filter and afterwards otherwise.
    pub async fn search(
        &self,
        input: VectorInput,
        options: SearchOptions,
    ) -> Result<Vec<VectorMatch>> {
        let limit = if options.limit == 0 { 10 } else { options.limit };
        let (query, _) = self.resolve(&input).await?;

        let entries = self.entries.read();
        let index = self.index.read();
        let matches_metadata = |id: &str| -> bool {
            let Some(filter) = &options.filter else {
                return true;
            };
            entries
                .get(id)
                .map(|entry| {
                    let probe = Document::with_id(
                        entry.id.clone(),
                        entry.metadata.clone().unwrap_or_default(),
                    );
                    filter.matches(&probe)
                })
                .unwrap_or(false)
        };

        let prefilter = index.supports_prefilter() && options.filter.is_some();
        let candidates = if prefilter {
            index.search(&query, 2 * limit, Some(&matches_metadata))
        } else {
            index.search(&query, 2 * limit, None)
        };
        debug!(candidates = candidates.len(), prefilter, "vector search");

        let mut out = Vec::with_capacity(limit);
        for hit in candidates {
            if !prefilter && !matches_metadata(&hit.id) {
                continue;
            }
            if let Some(min) = options.min_score {
                if hit.score < min {
                    continue;
                }
            }
            let Some(entry) = entries.get(&hit.id) else {
                continue;
            };
            out.push(VectorMatch {
                id: hit.id,
                score: hit.score,
                metadata: entry.metadata.clone(),
                text: entry.text.clone(),
            });
            if out.len() == limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn stats(&self) -> VectorStoreStats {
        VectorStoreStats {
            entries: self.entries.read().len(),
            indexed: self.index.read().len(),
            dimensions: self.config.dimensions,
            metric: self.config.metric,
            cached_embeddings: self.cache.lock().len(),
        }
    }

    /// Persist entries to disk; the index is rebuilt on load. Entries go
    /// through JSON because the dynamic metadata values need a
    /// self-describing format.
    pub fn save(&self, path: &Path) -> Result<()> {
        let entries: Vec<VectorEntry> = self.entries.read().values().cloned().collect();
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer(writer, &entries)?;
        Ok(())
    }

    /// Load entries saved by [`VectorStore::save`], replacing the current
    /// contents
    pub fn load(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let loaded: Vec<VectorEntry> = serde_json::from_reader(reader)?;

        let mut entries = self.entries.write();
        let mut index = self.index.write();
        entries.clear();
        index.clear();
        for entry in loaded {
            index.add(&entry.id, &entry.vector)?;
            entries.insert(entry.id.clone(), entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::HashingEmbedder;

    fn meta(pairs: &[(&str, Value)]) -> Option<HashMap<String, Value>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn basis(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; 4];
        v[axis] = 1.0;
        v
    }

    async fn seeded_store() -> VectorStore {
        let store = VectorStore::new(VectorStoreConfig::flat(4));
        let docs = [
            ("a", 0, "sports", 2023),
            ("b", 1, "tech", 2023),
            ("c", 0, "tech", 2024),
            ("d", 2, "food", 2024),
        ];
        for (id, axis, category, year) in docs {
            store
                .upsert(
                    id,
                    VectorInput::Vector(basis(axis)),
                    meta(&[("category", category.into()), ("year", (year as i64).into())]),
                )
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let store = seeded_store().await;
        let entry = store.get("a").unwrap();
        assert_eq!(entry.vector, basis(0));
        assert_eq!(
            entry.metadata.unwrap().get("category"),
            Some(&Value::from("sports"))
        );
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let store = VectorStore::new(VectorStoreConfig::flat(4));
        let err = store
            .upsert("x", VectorInput::Vector(vec![1.0, 2.0]), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn filtered_search_returns_only_matching_entry() {
        let store = seeded_store().await;
        let filter = Filter::and(vec![
            Filter::eq("category", "tech"),
            Filter::gte("year", 2024),
        ]);
        let hits = store
            .search(
                VectorInput::Vector(vec![1.0, 0.0, 0.0, 0.0]),
                SearchOptions::limit(10).with_filter(filter),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c");
    }

    #[tokio::test]
    async fn deleted_entries_are_excluded_from_search() {
        let store = seeded_store().await;
        store.delete("a");
        let hits = store
            .search(
                VectorInput::Vector(basis(0)),
                SearchOptions::limit(10),
            )
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.id != "a"));
    }

    #[tokio::test]
    async fn min_score_prunes_weak_matches() {
        let store = seeded_store().await;
        let hits = store
            .search(
                VectorInput::Vector(basis(0)),
                SearchOptions::limit(10).with_min_score(0.9),
            )
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.score >= 0.9));
        assert!(!hits.is_empty());
    }

    #[tokio::test]
    async fn text_upsert_uses_cache_on_repeat() {
        let store = VectorStore::new(VectorStoreConfig::flat(16))
            .with_embedder(Arc::new(HashingEmbedder::new(16)));
        store
            .upsert("t1", VectorInput::Text("hello world".into()), None)
            .await
            .unwrap();
        assert_eq!(store.stats().cached_embeddings, 1);

        // Second upsert of the same text hits the cache.
        store
            .upsert("t2", VectorInput::Text("hello world".into()), None)
            .await
            .unwrap();
        assert_eq!(store.stats().cached_embeddings, 1);
        assert_eq!(store.get("t1").unwrap().vector, store.get("t2").unwrap().vector);
    }

    #[tokio::test]
    async fn batch_upsert_reports_per_id_failures() {
        let store = VectorStore::new(VectorStoreConfig::flat(4));
        let report = store
            .upsert_batch(vec![
                BatchItem {
                    id: "good".into(),
                    input: VectorInput::Vector(basis(1)),
                    metadata: None,
                },
                BatchItem {
                    id: "bad".into(),
                    input: VectorInput::Vector(vec![1.0]),
                    metadata: None,
                },
                BatchItem {
                    id: "textual".into(),
                    input: VectorInput::Text("no embedder".into()),
                    metadata: None,
                },
            ])
            .await
            .unwrap();
        assert_eq!(report.succeeded, vec!["good".to_string()]);
        assert_eq!(report.failed.len(), 2);
    }

    #[tokio::test]
    async fn save_load_roundtrip_preserves_entries() {
        let store = seeded_store().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        store.save(&path).unwrap();

        let restored = VectorStore::new(VectorStoreConfig::flat(4));
        restored.load(&path).unwrap();
        assert_eq!(restored.len(), 4);
        let hits = restored
            .search(VectorInput::Vector(basis(2)), SearchOptions::limit(1))
            .await
            .unwrap();
        assert_eq!(hits[0].id, "d");
    }

    #[tokio::test]
    async fn hnsw_store_searches_consistently() {
        let store = VectorStore::new(VectorStoreConfig::hnsw(4, HnswParams::default()));
        for axis in 0..4 {
            store
                .upsert(&format!("v{axis}"), VectorInput::Vector(basis(axis)), None)
                .await
                .unwrap();
        }
        let hits = store
            .search(VectorInput::Vector(basis(2)), SearchOptions::limit(2))
            .await
            .unwrap();
        assert_eq!(hits[0].id, "v2");
    }
}
