//! In-memory storage adapter
//!
//! The reference adapter: a `BTreeMap` per collection behind a
//! `parking_lot::RwLock`, with secondary indexes, soft-delete tombstones
//! and a broadcast change stream. Transactions are map-copy: `begin`
//! snapshots the named stores and `rollback` restores them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use crate::changes::{ChangeEvent, ChangeOperation, ChangeStream};
use crate::config::ChangeStreamConfig;
use crate::error::{EddyError, Result};
use crate::query::{self, Filter, QuerySpec};
use crate::types::{now_millis, Document, DocumentId, Value};

use super::{
    AdapterStats, DocumentStore, IndexDefinition, StorageAdapter, TransactionHandle,
    TransactionMode,
};

#[derive(Default)]
struct SharedCounters {
    puts: AtomicU64,
    deletes: AtomicU64,
    queries: AtomicU64,
}

/// In-memory storage adapter
pub struct MemoryAdapter {
    config: ChangeStreamConfig,
    stores: DashMap<String, Arc<MemoryStore>>,
    initialized: Arc<AtomicBool>,
    counters: Arc<SharedCounters>,
    txn: Mutex<Option<ActiveTransaction>>,
    txn_ids: AtomicU64,
}

struct ActiveTransaction {
    id: u64,
    snapshots: HashMap<String, StoreSnapshot>,
}

struct StoreSnapshot {
    docs: BTreeMap<DocumentId, Document>,
    sequence: u64,
}

impl MemoryAdapter {
    pub fn new(config: ChangeStreamConfig) -> Self {
        Self {
            config,
            stores: DashMap::new(),
            initialized: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(SharedCounters::default()),
            txn: Mutex::new(None),
            txn_ids: AtomicU64::new(0),
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(EddyError::NotInitialized("memory adapter".to_string()))
        }
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new(ChangeStreamConfig::default())
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        debug!("memory adapter initialized");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn store(&self, name: &str) -> Result<Arc<dyn DocumentStore>> {
        self.ensure_available()?;
        let store = self
            .stores
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryStore::new(
                    name.to_string(),
                    self.config.buffer_capacity,
                    self.initialized.clone(),
                    self.counters.clone(),
                ))
            })
            .clone();
        Ok(store)
    }

    fn has_store(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    fn list_stores(&self) -> Vec<String> {
        self.stores.iter().map(|e| e.key().clone()).collect()
    }

    async fn delete_store(&self, name: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.stores.remove(name).is_some())
    }

    async fn begin(&self, stores: &[String], _mode: TransactionMode) -> Result<TransactionHandle> {
        self.ensure_available()?;
        let mut active = self.txn.lock();
        if active.is_some() {
            // Nested transaction: execute inline under the outer scope.
            return Ok(TransactionHandle {
                id: self.txn_ids.fetch_add(1, Ordering::SeqCst) + 1,
                nested: true,
            });
        }

        let mut snapshots = HashMap::with_capacity(stores.len());
        for name in stores {
            if let Some(store) = self.stores.get(name) {
                snapshots.insert(name.clone(), store.snapshot());
            }
        }
        let id = self.txn_ids.fetch_add(1, Ordering::SeqCst) + 1;
        *active = Some(ActiveTransaction { id, snapshots });
        Ok(TransactionHandle { id, nested: false })
    }

    async fn commit(&self, txn: TransactionHandle) -> Result<()> {
        if txn.nested {
            return Ok(());
        }
        let mut active = self.txn.lock();
        match active.take() {
            Some(t) if t.id == txn.id => Ok(()),
            other => {
                *active = other;
                Err(EddyError::Internal("commit of unknown transaction".into()))
            }
        }
    }

    async fn rollback(&self, txn: TransactionHandle) -> Result<()> {
        if txn.nested {
            return Ok(());
        }
        let mut active = self.txn.lock();
        match active.take() {
            Some(t) if t.id == txn.id => {
                for (name, snapshot) in t.snapshots {
                    if let Some(store) = self.stores.get(&name) {
                        store.restore(snapshot);
                    }
                }
                Ok(())
            }
            other => {
                *active = other;
                Err(EddyError::Internal("rollback of unknown transaction".into()))
            }
        }
    }

    fn stats(&self) -> AdapterStats {
        let documents = self
            .stores
            .iter()
            .map(|e| e.value().live_count())
            .sum::<usize>();
        AdapterStats {
            stores: self.stores.len(),
            documents,
            puts: self.counters.puts.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            queries: self.counters.queries.load(Ordering::Relaxed),
        }
    }
}

struct IndexState {
    def: IndexDefinition,
    entries: BTreeMap<Vec<u8>, BTreeSet<DocumentId>>,
}

struct StoreInner {
    docs: BTreeMap<DocumentId, Document>,
    indexes: HashMap<String, IndexState>,
}

/// In-memory document store for one collection
pub struct MemoryStore {
    name: String,
    inner: RwLock<StoreInner>,
    sequence: AtomicU64,
    stream: ChangeStream,
    available: Arc<AtomicBool>,
    counters: Arc<SharedCounters>,
}

impl MemoryStore {
    fn new(
        name: String,
        buffer_capacity: usize,
        available: Arc<AtomicBool>,
        counters: Arc<SharedCounters>,
    ) -> Self {
        Self {
            name,
            inner: RwLock::new(StoreInner {
                docs: BTreeMap::new(),
                indexes: HashMap::new(),
            }),
            sequence: AtomicU64::new(0),
            stream: ChangeStream::new(buffer_capacity),
            available,
            counters,
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(EddyError::NotInitialized(format!("store {}", self.name)))
        }
    }

    fn live_count(&self) -> usize {
        self.inner.read().docs.values().filter(|d| !d.deleted).count()
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            docs: self.inner.read().docs.clone(),
            sequence: self.sequence.load(Ordering::SeqCst),
        }
    }

    /// Restore a transaction snapshot: the document map and sequence
    /// counter rewind together so state and stream stay aligned, and
    /// indexes are rebuilt from the restored documents.
    fn restore(&self, snapshot: StoreSnapshot) {
        let mut inner = self.inner.write();
        inner.docs = snapshot.docs;
        self.sequence.store(snapshot.sequence, Ordering::SeqCst);
        let defs: Vec<IndexDefinition> =
            inner.indexes.values().map(|s| s.def.clone()).collect();
        inner.indexes.clear();
        for def in defs {
            // Uniqueness held before the transaction started.
            let _ = build_index(&mut inner, def);
        }
    }

    fn publish(&self, event: ChangeEvent) {
        self.stream.publish(event);
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Canonical byte encoding of one indexed value, tagged per type so keys
/// of different types never collide
fn encode_index_value(value: Option<&Value>) -> Vec<u8> {
    let mut out = Vec::new();
    match value {
        None | Some(Value::Null) => out.push(0x00),
        Some(Value::Bool(b)) => {
            out.push(0x01);
            out.push(*b as u8);
        }
        Some(v) if v.as_f64().is_some() => {
            out.push(0x02);
            out.extend_from_slice(&v.as_f64().unwrap().to_be_bytes());
        }
        Some(Value::String(s)) => {
            out.push(0x03);
            out.extend_from_slice(s.as_bytes());
        }
        Some(other) => {
            out.push(0x04);
            out.extend_from_slice(
                serde_json::to_string(other).unwrap_or_default().as_bytes(),
            );
        }
    }
    out
}

fn index_key(def: &IndexDefinition, doc: &Document) -> Option<Vec<u8>> {
    if def.sparse && def.fields.iter().all(|f| doc.field(&f.path).is_none()) {
        return None;
    }
    let mut key = Vec::new();
    for field in &def.fields {
        let part = encode_index_value(doc.field(&field.path));
        key.extend_from_slice(&(part.len() as u32).to_be_bytes());
        key.extend_from_slice(&part);
    }
    Some(key)
}

fn unindex_doc(inner: &mut StoreInner, doc: &Document) {
    for state in inner.indexes.values_mut() {
        if let Some(key) = index_key(&state.def, doc) {
            if let Some(ids) = state.entries.get_mut(&key) {
                ids.remove(&doc.id);
                if ids.is_empty() {
                    state.entries.remove(&key);
                }
            }
        }
    }
}

fn index_doc(inner: &mut StoreInner, doc: &Document) -> Result<()> {
    // Validate unique constraints before touching any entries.
    for state in inner.indexes.values() {
        if !state.def.unique {
            continue;
        }
        if let Some(key) = index_key(&state.def, doc) {
            if let Some(ids) = state.entries.get(&key) {
                if ids.iter().any(|id| id != &doc.id) {
                    return Err(EddyError::ConstraintViolation(format!(
                        "unique index {} violated by document {}",
                        state.def.name, doc.id
                    )));
                }
            }
        }
    }
    for state in inner.indexes.values_mut() {
        if let Some(key) = index_key(&state.def, doc) {
            state.entries.entry(key).or_default().insert(doc.id.clone());
        }
    }
    Ok(())
}

fn build_index(inner: &mut StoreInner, def: IndexDefinition) -> Result<()> {
    let mut entries: BTreeMap<Vec<u8>, BTreeSet<DocumentId>> = BTreeMap::new();
    for doc in inner.docs.values().filter(|d| !d.deleted) {
        if let Some(key) = index_key(&def, doc) {
            let ids = entries.entry(key).or_default();
            if def.unique && !ids.is_empty() {
                return Err(EddyError::ConstraintViolation(format!(
                    "unique index {} violated by document {}",
                    def.name, doc.id
                )));
            }
            ids.insert(doc.id.clone());
        }
    }
    inner
        .indexes
        .insert(def.name.clone(), IndexState { def, entries });
    Ok(())
}

/// Candidate ids from an equality predicate the store has an index for
fn index_candidates(inner: &StoreInner, filter: &Filter) -> Option<Vec<DocumentId>> {
    let (path, value) = match filter {
        Filter::Cmp {
            path,
            op: query::CompareOp::Eq,
            value,
        } => (path, value),
        Filter::And(clauses) => {
            return clauses.iter().find_map(|c| index_candidates(inner, c));
        }
        _ => return None,
    };
    let state = inner
        .indexes
        .values()
        .find(|s| s.def.fields.len() == 1 && &s.def.fields[0].path == path)?;
    let key = {
        let part = encode_index_value(Some(value));
        let mut k = Vec::new();
        k.extend_from_slice(&(part.len() as u32).to_be_bytes());
        k.extend_from_slice(&part);
        k
    };
    Some(
        state
            .entries
            .get(&key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default(),
    )
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        self.ensure_available()?;
        let inner = self.inner.read();
        Ok(inner.docs.get(id).filter(|d| !d.deleted).cloned())
    }

    async fn get_many(&self, ids: &[DocumentId]) -> Result<Vec<Option<Document>>> {
        self.ensure_available()?;
        let inner = self.inner.read();
        Ok(ids
            .iter()
            .map(|id| inner.docs.get(id).filter(|d| !d.deleted).cloned())
            .collect())
    }

    async fn get_all(&self) -> Result<Vec<Document>> {
        self.ensure_available()?;
        let inner = self.inner.read();
        Ok(inner.docs.values().filter(|d| !d.deleted).cloned().collect())
    }

    async fn put(&self, mut doc: Document) -> Result<Document> {
        self.ensure_available()?;
        let mut inner = self.inner.write();

        let previous = inner.docs.get(&doc.id).cloned();
        if let Some(prev) = &previous {
            doc.revision = prev.revision + 1;
            doc.created_at = prev.created_at;
            // Keep per-store write times monotonic even within one millisecond.
            doc.updated_at = now_millis().max(prev.updated_at + 1);
        } else {
            doc.revision = 1;
            doc.updated_at = now_millis();
        }
        doc.deleted = false;

        if let Some(prev) = previous.as_ref().filter(|p| !p.deleted) {
            unindex_doc(&mut inner, prev);
        }
        if let Err(e) = index_doc(&mut inner, &doc) {
            // Re-index the previous state before surfacing the violation.
            if let Some(prev) = previous.as_ref().filter(|p| !p.deleted) {
                let _ = index_doc(&mut inner, prev);
            }
            return Err(e);
        }
        inner.docs.insert(doc.id.clone(), doc.clone());

        let operation = if previous.is_some() {
            ChangeOperation::Update
        } else {
            ChangeOperation::Insert
        };
        let event = ChangeEvent {
            operation,
            document_id: doc.id.clone(),
            document: Some(doc.clone()),
            previous: previous.filter(|p| !p.deleted),
            is_from_sync: false,
            timestamp: doc.updated_at,
            sequence: self.next_sequence(),
        };
        // Publish while still holding the write lock so sequences and
        // delivery order can never diverge.
        self.publish(event);
        drop(inner);

        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        Ok(doc)
    }

    async fn bulk_put(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        self.ensure_available()?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            out.push(self.put(doc).await?);
        }
        Ok(out)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.ensure_available()?;
        let mut inner = self.inner.write();
        let previous = match inner.docs.get(id) {
            Some(doc) if !doc.deleted => doc.clone(),
            _ => return Ok(false),
        };

        let mut tombstone = previous.clone();
        tombstone.deleted = true;
        tombstone.revision += 1;
        tombstone.updated_at = now_millis().max(previous.updated_at + 1);

        unindex_doc(&mut inner, &previous);
        inner.docs.insert(id.to_string(), tombstone.clone());

        let event = ChangeEvent {
            operation: ChangeOperation::Delete,
            document_id: id.to_string(),
            document: None,
            previous: Some(previous),
            is_from_sync: false,
            timestamp: tombstone.updated_at,
            sequence: self.next_sequence(),
        };
        self.publish(event);
        drop(inner);

        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn purge(&self, id: &str) -> Result<bool> {
        self.ensure_available()?;
        let mut inner = self.inner.write();
        let removed = match inner.docs.remove(id) {
            Some(doc) => doc,
            None => return Ok(false),
        };
        if removed.deleted {
            return Ok(true);
        }
        unindex_doc(&mut inner, &removed);
        let event = ChangeEvent {
            operation: ChangeOperation::Delete,
            document_id: id.to_string(),
            document: None,
            previous: Some(removed),
            is_from_sync: false,
            timestamp: now_millis(),
            sequence: self.next_sequence(),
        };
        self.publish(event);
        drop(inner);

        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn query(&self, spec: &QuerySpec) -> Result<Vec<Document>> {
        self.ensure_available()?;
        query::validate(spec)?;
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let candidates = {
            let inner = self.inner.read();
            let from_index = spec
                .filter
                .as_ref()
                .and_then(|f| index_candidates(&inner, f));
            match from_index {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| inner.docs.get(id))
                    .filter(|d| !d.deleted)
                    .cloned()
                    .collect(),
                None => inner
                    .docs
                    .values()
                    .filter(|d| !d.deleted)
                    .cloned()
                    .collect::<Vec<_>>(),
            }
        };
        Ok(query::execute(candidates, spec))
    }

    async fn count(&self, spec: Option<&QuerySpec>) -> Result<usize> {
        match spec {
            None => Ok(self.live_count()),
            Some(spec) => {
                // Cardinality follows the filter alone; pagination and
                // projection do not apply.
                let counting = QuerySpec {
                    filter: spec.filter.clone(),
                    ..QuerySpec::default()
                };
                Ok(self.query(&counting).await?.len())
            }
        }
    }

    async fn create_index(&self, def: IndexDefinition) -> Result<()> {
        self.ensure_available()?;
        if def.fields.is_empty() {
            return Err(EddyError::InvalidArgument(
                "index needs at least one field".to_string(),
            ));
        }
        let mut inner = self.inner.write();
        build_index(&mut inner, def)
    }

    async fn drop_index(&self, name: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.inner.write().indexes.remove(name).is_some())
    }

    fn indexes(&self) -> Vec<IndexDefinition> {
        self.inner
            .read()
            .indexes
            .values()
            .map(|s| s.def.clone())
            .collect()
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.stream.subscribe()
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_available()?;
        let mut inner = self.inner.write();
        let live: Vec<Document> = inner.docs.values().filter(|d| !d.deleted).cloned().collect();
        inner.docs.clear();
        for state in inner.indexes.values_mut() {
            state.entries.clear();
        }
        let now = now_millis();
        for doc in live {
            let event = ChangeEvent {
                operation: ChangeOperation::Delete,
                document_id: doc.id.clone(),
                document: None,
                previous: Some(doc),
                is_from_sync: false,
                timestamp: now,
                sequence: self.next_sequence(),
            };
            self.publish(event);
        }
        Ok(())
    }

    async fn len(&self) -> usize {
        self.live_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SortSpec;

    async fn open_store() -> (MemoryAdapter, Arc<dyn DocumentStore>) {
        let adapter = MemoryAdapter::default();
        adapter.initialize().await.unwrap();
        let store = adapter.store("users").unwrap();
        (adapter, store)
    }

    fn doc(id: &str, fields: &[(&str, Value)]) -> Document {
        Document::with_id(
            id,
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let (_adapter, store) = open_store().await;
        store.put(doc("u1", &[("name", "Ada".into())])).await.unwrap();
        assert!(store.get("u1").await.unwrap().is_some());

        assert!(store.delete("u1").await.unwrap());
        assert!(store.get("u1").await.unwrap().is_none());
        // Deleting a tombstone is a no-op
        assert!(!store.delete("u1").await.unwrap());
    }

    #[tokio::test]
    async fn sequences_are_contiguous_and_ordered() {
        let (_adapter, store) = open_store().await;
        let mut rx = store.changes();

        store.put(doc("a", &[])).await.unwrap();
        store.put(doc("a", &[("x", 1.into())])).await.unwrap();
        store.delete("a").await.unwrap();

        let ops: Vec<(ChangeOperation, u64)> = vec![
            rx.recv().await.map(|e| (e.operation, e.sequence)).unwrap(),
            rx.recv().await.map(|e| (e.operation, e.sequence)).unwrap(),
            rx.recv().await.map(|e| (e.operation, e.sequence)).unwrap(),
        ];
        assert_eq!(
            ops,
            vec![
                (ChangeOperation::Insert, 1),
                (ChangeOperation::Update, 2),
                (ChangeOperation::Delete, 3),
            ]
        );
    }

    #[tokio::test]
    async fn delete_event_carries_previous() {
        let (_adapter, store) = open_store().await;
        let mut rx = store.changes();
        store.put(doc("a", &[("x", 1.into())])).await.unwrap();
        store.delete("a").await.unwrap();

        rx.recv().await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation, ChangeOperation::Delete);
        assert!(event.document.is_none());
        assert_eq!(event.previous.unwrap().get("x"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn query_excludes_tombstones() {
        let (_adapter, store) = open_store().await;
        store.put(doc("a", &[("n", 1.into())])).await.unwrap();
        store.put(doc("b", &[("n", 2.into())])).await.unwrap();
        store.delete("a").await.unwrap();

        let results = store
            .query(&QuerySpec::all().with_sort(SortSpec::asc("n")))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "b");
        assert_eq!(store.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicates() {
        let (_adapter, store) = open_store().await;
        store
            .create_index(IndexDefinition::new("idx_email", &["email"]).unique())
            .await
            .unwrap();
        store
            .put(doc("a", &[("email", "x@y.z".into())]))
            .await
            .unwrap();
        let err = store
            .put(doc("b", &[("email", "x@y.z".into())]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_CONSTRAINT");
        // The failed put emitted no event and left no document behind.
        assert!(store.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn index_assisted_equality_query() {
        let (_adapter, store) = open_store().await;
        store
            .create_index(IndexDefinition::new("idx_status", &["status"]))
            .await
            .unwrap();
        for i in 0..10 {
            let status = if i % 2 == 0 { "active" } else { "idle" };
            store
                .put(doc(&format!("d{i}"), &[("status", status.into())]))
                .await
                .unwrap();
        }
        let results = store
            .query(&QuerySpec::filtered(Filter::eq("status", "active")))
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
    }

    #[tokio::test]
    async fn transaction_rollback_restores_state() {
        let (adapter, store) = open_store().await;
        store.put(doc("a", &[("n", 1.into())])).await.unwrap();

        let txn = adapter
            .begin(&["users".to_string()], TransactionMode::ReadWrite)
            .await
            .unwrap();
        store.put(doc("a", &[("n", 2.into())])).await.unwrap();
        store.put(doc("b", &[])).await.unwrap();
        adapter.rollback(txn).await.unwrap();

        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.get("n"), Some(&Value::Int(1)));
        assert!(store.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nested_transactions_flatten() {
        let (adapter, store) = open_store().await;
        let outer = adapter
            .begin(&["users".to_string()], TransactionMode::ReadWrite)
            .await
            .unwrap();
        let inner = adapter
            .begin(&["users".to_string()], TransactionMode::ReadWrite)
            .await
            .unwrap();
        store.put(doc("a", &[])).await.unwrap();
        // Inner commit is a no-op; the outer rollback still wins.
        adapter.commit(inner).await.unwrap();
        adapter.rollback(outer).await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_adapter_rejects_operations() {
        let (adapter, store) = open_store().await;
        adapter.close().await.unwrap();
        let err = store.get("a").await.unwrap_err();
        assert_eq!(err.code(), "E_NOT_INITIALIZED");
    }

    #[tokio::test]
    async fn clear_emits_delete_per_live_document() {
        let (_adapter, store) = open_store().await;
        store.put(doc("a", &[])).await.unwrap();
        store.put(doc("b", &[])).await.unwrap();
        store.delete("b").await.unwrap();

        let mut rx = store.changes();
        store.clear().await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation, ChangeOperation::Delete);
        assert_eq!(event.document_id, "a");
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn put_after_delete_is_update() {
        let (_adapter, store) = open_store().await;
        let mut rx = store.changes();
        store.put(doc("a", &[])).await.unwrap();
        store.delete("a").await.unwrap();
        store.put(doc("a", &[("back", true.into())])).await.unwrap();

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        let revived = rx.recv().await.unwrap();
        assert_eq!(revived.operation, ChangeOperation::Update);
        assert!(store.get("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sparse_index_skips_docs_without_field() {
        let (_adapter, store) = open_store().await;
        store
            .create_index(IndexDefinition::new("idx_tag", &["tag"]).unique().sparse())
            .await
            .unwrap();
        // Two docs without the field coexist under a sparse unique index.
        store.put(doc("a", &[])).await.unwrap();
        store.put(doc("b", &[])).await.unwrap();
        store.put(doc("c", &[("tag", "t".into())])).await.unwrap();
        let err = store.put(doc("d", &[("tag", "t".into())])).await.unwrap_err();
        assert_eq!(err.code(), "E_CONSTRAINT");
    }
}
