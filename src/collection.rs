//! Collection - the public façade over a document store
//!
//! Adds validation, automatic timestamps, the soft-delete policy and
//! live-query factories on top of the raw [`DocumentStore`] contract.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::changes::ChangeEvent;
use crate::config::CollectionConfig;
use crate::error::{EddyError, Result};
use crate::query::QuerySpec;
use crate::storage::{DocumentStore, IndexDefinition};
use crate::types::{Document, DocumentId, Value};

/// Validation hook; returns a human-readable rejection reason
pub type Validator = Arc<dyn Fn(&Document) -> std::result::Result<(), String> + Send + Sync>;

/// A named collection of documents
pub struct Collection {
    name: String,
    store: Arc<dyn DocumentStore>,
    config: CollectionConfig,
    validator: Option<Validator>,
}

impl Collection {
    pub fn new(name: String, store: Arc<dyn DocumentStore>, config: CollectionConfig) -> Self {
        Self {
            name,
            store,
            config,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn validate(&self, doc: &Document) -> Result<()> {
        if let Some(validator) = &self.validator {
            validator(doc).map_err(EddyError::ValidationFailed)?;
        }
        Ok(())
    }

    /// Stamp the queryable timestamp fields when the policy is on
    fn stamp(&self, doc: &mut Document, created: bool) {
        if !self.config.timestamps {
            return;
        }
        let now = crate::types::now_millis();
        if created {
            doc.data
                .entry("createdAt".to_string())
                .or_insert(Value::Int(now));
        }
        doc.data.insert("updatedAt".to_string(), Value::Int(now));
    }

    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        self.store.get(id).await.map_err(|e| e.in_op("collection.get"))
    }

    pub async fn get_many(&self, ids: &[DocumentId]) -> Result<Vec<Option<Document>>> {
        self.store
            .get_many(ids)
            .await
            .map_err(|e| e.in_op("collection.get_many"))
    }

    pub async fn get_all(&self) -> Result<Vec<Document>> {
        self.store
            .get_all()
            .await
            .map_err(|e| e.in_op("collection.get_all"))
    }

    /// Create a document. Fails when a live document already holds the id;
    /// reviving a tombstone is allowed.
    pub async fn insert(&self, mut doc: Document) -> Result<Document> {
        if self.store.get(&doc.id).await?.is_some() {
            return Err(EddyError::ConstraintViolation(format!(
                "document already exists: {}",
                doc.id
            ))
            .in_op("collection.insert"));
        }
        self.stamp(&mut doc, true);
        self.validate(&doc).map_err(|e| e.in_op("collection.insert"))?;
        self.store
            .put(doc)
            .await
            .map_err(|e| e.in_op("collection.insert"))
    }

    /// Replace an existing live document
    pub async fn update(&self, mut doc: Document) -> Result<Document> {
        if self.store.get(&doc.id).await?.is_none() {
            return Err(EddyError::not_found("document", doc.id.clone())
                .in_op("collection.update"));
        }
        self.stamp(&mut doc, false);
        self.validate(&doc).map_err(|e| e.in_op("collection.update"))?;
        self.store
            .put(doc)
            .await
            .map_err(|e| e.in_op("collection.update"))
    }

    /// Insert-or-replace
    pub async fn upsert(&self, mut doc: Document) -> Result<Document> {
        let created = self.store.get(&doc.id).await?.is_none();
        self.stamp(&mut doc, created);
        self.validate(&doc).map_err(|e| e.in_op("collection.upsert"))?;
        self.store
            .put(doc)
            .await
            .map_err(|e| e.in_op("collection.upsert"))
    }

    pub async fn bulk_upsert(&self, mut docs: Vec<Document>) -> Result<Vec<Document>> {
        for doc in &mut docs {
            let created = self.store.get(&doc.id).await?.is_none();
            self.stamp(doc, created);
            self.validate(doc).map_err(|e| e.in_op("collection.bulk_upsert"))?;
        }
        self.store
            .bulk_put(docs)
            .await
            .map_err(|e| e.in_op("collection.bulk_upsert"))
    }

    /// Soft-delete; the tombstone remains until purged
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.store
            .delete(id)
            .await
            .map_err(|e| e.in_op("collection.delete"))
    }

    /// Hard-delete, tombstone included
    pub async fn purge(&self, id: &str) -> Result<bool> {
        self.store
            .purge(id)
            .await
            .map_err(|e| e.in_op("collection.purge"))
    }

    pub async fn find(&self, spec: &QuerySpec) -> Result<Vec<Document>> {
        self.store
            .query(spec)
            .await
            .map_err(|e| e.in_op("collection.find"))
    }

    pub async fn count(&self, spec: Option<&QuerySpec>) -> Result<usize> {
        self.store
            .count(spec)
            .await
            .map_err(|e| e.in_op("collection.count"))
    }

    pub async fn create_index(&self, def: IndexDefinition) -> Result<()> {
        self.store
            .create_index(def)
            .await
            .map_err(|e| e.in_op("collection.create_index"))
    }

    pub async fn drop_index(&self, name: &str) -> Result<bool> {
        self.store
            .drop_index(name)
            .await
            .map_err(|e| e.in_op("collection.drop_index"))
    }

    pub fn indexes(&self) -> Vec<IndexDefinition> {
        self.store.indexes()
    }

    /// Subscribe to the collection's change stream
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.store.changes()
    }

    /// Start a live query: the returned handle tracks the spec's results
    /// across changes. Re-evaluation runs in a background task; dropping
    /// the handle stops it.
    pub async fn watch(&self, spec: QuerySpec) -> Result<LiveQuery> {
        // Subscribe before the initial evaluation so nothing slips
        // between the snapshot and the stream.
        let mut events = self.store.changes();
        let initial = self.store.query(&spec).await?;
        let (tx, rx) = watch::channel(initial.clone());

        let store = self.store.clone();
        let name = self.name.clone();
        let mut last_ids: Vec<DocumentId> = initial.iter().map(|d| d.id.clone()).collect();

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    // Dropped events may have touched anything; a lagged
                    // subscriber falls through to a full re-evaluation.
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                    Ok(event) => {
                        if !relevant(&event, &spec, &last_ids) {
                            continue;
                        }
                    }
                }
                match store.query(&spec).await {
                    Ok(results) => {
                        last_ids = results.iter().map(|d| d.id.clone()).collect();
                        if tx.send(results).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(collection = %name, error = %e, "live query re-evaluation failed");
                    }
                }
            }
        });

        Ok(LiveQuery {
            receiver: rx,
            handle,
        })
    }
}

/// Could this event change the spec's result set?
fn relevant(event: &ChangeEvent, spec: &QuerySpec, last_ids: &[DocumentId]) -> bool {
    if last_ids.iter().any(|id| id == &event.document_id) {
        return true;
    }
    event.effective().map(|d| spec.matches(d)).unwrap_or(true)
}

/// Handle to a continuously maintained query result
pub struct LiveQuery {
    receiver: watch::Receiver<Vec<Document>>,
    handle: JoinHandle<()>,
}

impl LiveQuery {
    /// Current result array
    pub fn results(&self) -> Vec<Document> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next result change. Returns false once the live query
    /// has terminated.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    /// An independent subscriber sharing this query's evaluation
    pub fn subscribe(&self) -> watch::Receiver<Vec<Document>> {
        self.receiver.clone()
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
