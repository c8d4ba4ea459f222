//! Storage adapter and document-store contracts
//!
//! Persistence is pluggable: an adapter hands out per-collection document
//! stores and provides transaction scoping over them. Implementations must
//! uphold the soft-delete and sequence-ordering guarantees documented on
//! each method; callers rely on them for change tracking and views.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::changes::ChangeEvent;
use crate::error::Result;
use crate::query::QuerySpec;
use crate::types::{Document, DocumentId};

pub use memory::{MemoryAdapter, MemoryStore};

/// One field of an index, with direction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexField {
    pub path: String,
    pub direction: crate::query::SortDirection,
}

/// Normalized index definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<IndexField>,
    #[serde(default)]
    pub unique: bool,
    /// Sparse indexes skip documents missing every indexed field
    #[serde(default)]
    pub sparse: bool,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, paths: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: paths
                .iter()
                .map(|p| IndexField {
                    path: (*p).to_string(),
                    direction: crate::query::SortDirection::Asc,
                })
                .collect(),
            unique: false,
            sparse: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }
}

/// Transaction isolation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Opaque transaction handle returned by [`StorageAdapter::begin`].
///
/// A handle from a nested `begin` is flattened: committing or rolling it
/// back is a no-op and the outermost handle stays authoritative.
#[derive(Debug)]
pub struct TransactionHandle {
    pub(crate) id: u64,
    pub(crate) nested: bool,
}

/// Adapter-wide counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterStats {
    pub stores: usize,
    pub documents: usize,
    pub puts: u64,
    pub deletes: u64,
    pub queries: u64,
}

/// Pluggable persistence backend
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Prepare the adapter for use. Every other operation fails with
    /// `NotInitialized` before this succeeds or after `close`.
    async fn initialize(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_available(&self) -> bool;

    /// Get or create the named document store
    fn store(&self, name: &str) -> Result<Arc<dyn DocumentStore>>;

    fn has_store(&self, name: &str) -> bool;

    fn list_stores(&self) -> Vec<String>;

    async fn delete_store(&self, name: &str) -> Result<bool>;

    /// Open a transaction over the named stores. Nested calls flatten:
    /// when a transaction is already active the returned handle executes
    /// inline and only the outer commit/rollback takes effect.
    async fn begin(&self, stores: &[String], mode: TransactionMode) -> Result<TransactionHandle>;

    async fn commit(&self, txn: TransactionHandle) -> Result<()>;

    /// Restore the pre-transaction state of every store named at `begin`
    async fn rollback(&self, txn: TransactionHandle) -> Result<()>;

    fn stats(&self) -> AdapterStats;
}

/// Per-collection versioned document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the live document, or `None` for missing or soft-deleted
    async fn get(&self, id: &str) -> Result<Option<Document>>;

    /// Positional lookup; `None` entries mark missing or deleted ids
    async fn get_many(&self, ids: &[DocumentId]) -> Result<Vec<Option<Document>>>;

    /// All live (non-deleted) documents in id order
    async fn get_all(&self) -> Result<Vec<Document>>;

    /// Insert-or-replace. Emits `insert` on first appearance, `update`
    /// otherwise, with a fresh, strictly increasing sequence.
    async fn put(&self, doc: Document) -> Result<Document>;

    /// A sequence of `put`s under one transaction; each emits its own event
    async fn bulk_put(&self, docs: Vec<Document>) -> Result<Vec<Document>>;

    /// Soft-delete: keeps a tombstone, emits `delete` with the previous
    /// document. Returns false when the id is missing or already deleted.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Hard-delete: removes the entry outright, tombstone included.
    /// Emits `delete` only when the document was still live.
    async fn purge(&self, id: &str) -> Result<bool>;

    /// Filtered, sorted, paginated, projected; never yields deleted docs
    async fn query(&self, spec: &QuerySpec) -> Result<Vec<Document>>;

    /// Cardinality under the same filter semantics as `query`
    async fn count(&self, spec: Option<&QuerySpec>) -> Result<usize>;

    async fn create_index(&self, def: IndexDefinition) -> Result<()>;

    async fn drop_index(&self, name: &str) -> Result<bool>;

    fn indexes(&self) -> Vec<IndexDefinition>;

    /// Subscribe to the store's change stream; events arrive in sequence
    /// order
    fn changes(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Purge everything, tombstones included; emits one `delete` per live
    /// document
    async fn clear(&self) -> Result<()>;

    /// Live document count
    async fn len(&self) -> usize;
}
