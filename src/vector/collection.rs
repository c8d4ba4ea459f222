//! Auto-indexed vector view over a document collection
//!
//! Subscribes to the collection's change stream and keeps the vector
//! store in lockstep: inserts and updates re-embed the extracted text,
//! deletes drop the entry. Bulk indexing yields between chunks so change
//! events keep draining, and honors cancellation at those boundaries.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::changes::{ChangeEvent, ChangeOperation};
use crate::collection::Collection;
use crate::error::{EddyError, Result};
use crate::types::{Document, Value};

use super::store::{SearchOptions, VectorInput, VectorMatch, VectorStore};

/// Extracts the embeddable text of a document
pub type TextExtractor = Arc<dyn Fn(&Document) -> Option<String> + Send + Sync>;

/// Configuration for a [`VectorCollection`]
#[derive(Clone)]
pub struct VectorCollectionConfig {
    /// String fields concatenated (space-joined) into the embeddable text
    pub text_fields: Vec<String>,
    /// Overrides `text_fields` when set
    pub extractor: Option<TextExtractor>,
    /// Documents per chunk during bulk indexing
    pub chunk_size: usize,
}

impl Default for VectorCollectionConfig {
    fn default() -> Self {
        Self {
            text_fields: Vec::new(),
            extractor: None,
            chunk_size: 64,
        }
    }
}

impl VectorCollectionConfig {
    pub fn fields(fields: &[&str]) -> Self {
        Self {
            text_fields: fields.iter().map(|f| (*f).to_string()).collect(),
            ..Self::default()
        }
    }

    fn extract(&self, doc: &Document) -> Option<String> {
        if let Some(extractor) = &self.extractor {
            return extractor(doc).filter(|t| !t.trim().is_empty());
        }
        let mut parts = Vec::new();
        for field in &self.text_fields {
            if let Some(Value::String(s)) = doc.field(field) {
                if !s.trim().is_empty() {
                    parts.push(s.clone());
                }
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// A collection with an automatically maintained vector index
pub struct VectorCollection {
    collection: Arc<Collection>,
    store: Arc<VectorStore>,
    config: VectorCollectionConfig,
    sync_task: JoinHandle<()>,
}

impl VectorCollection {
    /// Wire a vector store to a collection's change stream
    pub fn new(
        collection: Arc<Collection>,
        store: Arc<VectorStore>,
        config: VectorCollectionConfig,
    ) -> Self {
        let sync_task = Self::spawn_sync(&collection, &store, config.clone());
        Self {
            collection,
            store,
            config,
            sync_task,
        }
    }

    fn spawn_sync(
        collection: &Arc<Collection>,
        store: &Arc<VectorStore>,
        config: VectorCollectionConfig,
    ) -> JoinHandle<()> {
        let mut events = collection.changes();
        let store = store.clone();
        let name = collection.name().to_string();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(collection = %name, missed, "vector sync lagged; some documents may be stale until reindex");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Err(e) = apply_event(&store, &config, &event).await {
                    warn!(collection = %name, document = %event.document_id, error = %e,
                        "vector sync failed for document");
                }
            }
        })
    }

    pub fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Index every live document with extractable text. Cancellation
    /// takes effect between chunks; entries already upserted remain.
    pub async fn index_all(&self, cancel: Option<&CancellationToken>) -> Result<usize> {
        let docs = self.collection.get_all().await?;
        let mut indexed = 0;

        for chunk in docs.chunks(self.config.chunk_size) {
            if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                debug!(indexed, "bulk index cancelled");
                return Err(EddyError::Cancelled.in_op("vector_collection.index_all"));
            }
            for doc in chunk {
                if let Some(text) = self.config.extract(doc) {
                    self.store
                        .upsert(&doc.id, VectorInput::Text(text), Some(doc.data.clone()))
                        .await?;
                    indexed += 1;
                }
            }
            // Let pending change events drain before the next chunk.
            tokio::task::yield_now().await;
        }
        Ok(indexed)
    }

    /// Rebuild the store from scratch
    pub async fn reindex_all(&self, cancel: Option<&CancellationToken>) -> Result<usize> {
        self.store.clear();
        self.index_all(cancel).await
    }

    /// Semantic search by free text
    pub async fn find_similar(
        &self,
        text: &str,
        options: SearchOptions,
    ) -> Result<Vec<VectorMatch>> {
        self.store
            .search(VectorInput::Text(text.to_string()), options)
            .await
    }

    /// Search with a pre-computed query vector
    pub async fn search_by_vector(
        &self,
        vector: Vec<f32>,
        options: SearchOptions,
    ) -> Result<Vec<VectorMatch>> {
        self.store.search(VectorInput::Vector(vector), options).await
    }

    pub fn indexed_count(&self) -> usize {
        self.store.len()
    }
}

impl Drop for VectorCollection {
    fn drop(&mut self) {
        self.sync_task.abort();
    }
}

async fn apply_event(
    store: &VectorStore,
    config: &VectorCollectionConfig,
    event: &ChangeEvent,
) -> Result<()> {
    match event.operation {
        ChangeOperation::Delete => {
            store.delete(&event.document_id);
            Ok(())
        }
        ChangeOperation::Insert | ChangeOperation::Update => {
            let Some(doc) = event.document.as_ref() else {
                return Ok(());
            };
            match config.extract(doc) {
                Some(text) => {
                    store
                        .upsert(&doc.id, VectorInput::Text(text), Some(doc.data.clone()))
                        .await?;
                }
                // A document whose text emptied out leaves the index.
                None => {
                    store.delete(&doc.id);
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionConfig;
    use crate::storage::{MemoryAdapter, StorageAdapter};
    use crate::vector::store::VectorStoreConfig;
    use crate::vector::HashingEmbedder;
    use std::collections::HashMap;

    async fn setup() -> (Arc<Collection>, VectorCollection) {
        let adapter = MemoryAdapter::default();
        adapter.initialize().await.unwrap();
        let store = adapter.store("articles").unwrap();
        let collection = Arc::new(Collection::new(
            "articles".to_string(),
            store,
            CollectionConfig::default(),
        ));
        let vectors = Arc::new(
            VectorStore::new(VectorStoreConfig::flat(32))
                .with_embedder(Arc::new(HashingEmbedder::new(32))),
        );
        let vc = VectorCollection::new(
            collection.clone(),
            vectors,
            VectorCollectionConfig::fields(&["title", "body"]),
        );
        (collection, vc)
    }

    fn article(id: &str, title: &str, body: &str) -> Document {
        let mut data = HashMap::new();
        data.insert("title".to_string(), Value::from(title));
        data.insert("body".to_string(), Value::from(body));
        Document::with_id(id, data)
    }

    async fn settle() {
        // Give the sync task a chance to drain the change stream.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn inserts_are_auto_indexed() {
        let (collection, vc) = setup().await;
        collection
            .insert(article("a1", "rust databases", "embedded storage engines"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(vc.indexed_count(), 1);

        let hits = vc
            .find_similar("rust storage", SearchOptions::limit(5))
            .await
            .unwrap();
        assert_eq!(hits[0].id, "a1");
    }

    #[tokio::test]
    async fn deletes_leave_the_index() {
        let (collection, vc) = setup().await;
        collection
            .insert(article("a1", "first", "text"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(vc.indexed_count(), 1);

        collection.delete("a1").await.unwrap();
        settle().await;
        assert_eq!(vc.indexed_count(), 0);
    }

    #[tokio::test]
    async fn documents_without_text_are_skipped() {
        let (collection, vc) = setup().await;
        collection
            .insert(Document::with_id("empty", HashMap::new()))
            .await
            .unwrap();
        collection
            .insert(article("full", "a title", ""))
            .await
            .unwrap();
        settle().await;

        assert_eq!(vc.index_all(None).await.unwrap(), 1);
        assert_eq!(vc.indexed_count(), 1);
    }

    #[tokio::test]
    async fn index_all_counts_live_documents() {
        let (collection, vc) = setup().await;
        for i in 0..10 {
            collection
                .insert(article(&format!("a{i}"), "title words", "body words"))
                .await
                .unwrap();
        }
        collection.delete("a0").await.unwrap();
        settle().await;

        let indexed = vc.index_all(None).await.unwrap();
        assert_eq!(indexed, 9);
        assert_eq!(vc.indexed_count(), 9);
    }

    #[tokio::test]
    async fn cancelled_bulk_index_keeps_partial_state() {
        let (collection, vc) = setup().await;
        for i in 0..5 {
            collection
                .insert(article(&format!("a{i}"), "words here", "more words"))
                .await
                .unwrap();
        }
        settle().await;

        let token = CancellationToken::new();
        token.cancel();
        let err = vc.reindex_all(Some(&token)).await.unwrap_err();
        assert!(matches!(
            err,
            EddyError::Op {
                source: box_source, ..
            } if matches!(*box_source, EddyError::Cancelled)
        ));
        // Cancelled before the first chunk: nothing was re-upserted, and
        // no partially written entries exist.
        assert_eq!(vc.indexed_count(), 0);
    }

    #[tokio::test]
    async fn custom_extractor_overrides_fields() {
        let adapter = MemoryAdapter::default();
        adapter.initialize().await.unwrap();
        let store = adapter.store("notes").unwrap();
        let collection = Arc::new(Collection::new(
            "notes".to_string(),
            store,
            CollectionConfig::default(),
        ));
        let vectors = Arc::new(
            VectorStore::new(VectorStoreConfig::flat(16))
                .with_embedder(Arc::new(HashingEmbedder::new(16))),
        );
        let config = VectorCollectionConfig {
            extractor: Some(Arc::new(|doc: &Document| {
                doc.field("summary").and_then(Value::as_str).map(String::from)
            })),
            ..VectorCollectionConfig::default()
        };
        let vc = VectorCollection::new(collection.clone(), vectors, config);

        let mut data = HashMap::new();
        data.insert("summary".to_string(), Value::from("condensed content"));
        collection
            .insert(Document::with_id("n1", data))
            .await
            .unwrap();
        settle().await;
        assert_eq!(vc.indexed_count(), 1);
    }
}
