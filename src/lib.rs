//! EddyDB Core
//!
//! A reactive, document-oriented embedded database runtime:
//!
//! - **Document engine** — collections over pluggable storage adapters,
//!   with validation, soft deletes, secondary indexes and a totally
//!   ordered change stream per store.
//! - **Live queries & materialized views** — query results that track
//!   changes incrementally, including sorted/limited projections and
//!   group-by aggregations.
//! - **Branching & snapshots** — copy-on-write document graphs with
//!   checkout, diff, fast-forward and three-way field-level merge.
//! - **Columnar time-series** — partitioned, delta/RLE-accounted point
//!   storage with bucketed aggregation and tiered retention.
//! - **Vector search** — flat and HNSW indexes with metadata filtering
//!   and pluggable text embedding.

pub mod branch;
pub mod changes;
pub mod collection;
pub mod config;
pub mod error;
pub mod query;
pub mod storage;
pub mod timeseries;
pub mod types;
pub mod vector;
pub mod view;

// Re-exports - core surface
pub use branch::{BranchManager, BranchOptions, MergeOptions, MergeStrategy};
pub use changes::{ChangeEvent, ChangeOperation};
pub use collection::{Collection, LiveQuery};
pub use config::DatabaseConfig;
pub use error::{EddyError, ErrorKind, Result};
pub use query::{Filter, Projection, QuerySpec, SortDirection, SortSpec};
pub use storage::{
    AdapterStats, DocumentStore, IndexDefinition, MemoryAdapter, StorageAdapter,
    TransactionMode,
};
pub use timeseries::{Aggregation, TimePoint, TimeSeriesStore};
pub use types::{Document, DocumentId, Value};
pub use vector::{
    DistanceMetric, VectorCollection, VectorStore, VectorStoreConfig,
};
pub use view::{ComputedViewDefinition, ViewDefinition, ViewManager};

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

/// Database instance: collections plus the view and branch engines
pub struct Database {
    config: DatabaseConfig,
    adapter: Arc<dyn StorageAdapter>,
    collections: DashMap<String, Arc<Collection>>,
    /// Collections already feeding the view manager
    attached: DashMap<String, ()>,
    views: Arc<ViewManager>,
    branches: Arc<BranchManager>,
}

impl Database {
    /// Open a database over the in-memory adapter
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        let adapter = Arc::new(MemoryAdapter::new(config.changes.clone()));
        Self::with_adapter(config, adapter).await
    }

    /// Open a database over a caller-supplied adapter
    pub async fn with_adapter(
        config: DatabaseConfig,
        adapter: Arc<dyn StorageAdapter>,
    ) -> Result<Self> {
        adapter.initialize().await?;
        info!("database opened");
        Ok(Self {
            views: Arc::new(ViewManager::new(config.views.clone())),
            branches: Arc::new(BranchManager::new(config.branches.clone())),
            config,
            adapter,
            collections: DashMap::new(),
            attached: DashMap::new(),
        })
    }

    /// Get or create a collection
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        if let Some(existing) = self.collections.get(name) {
            return Ok(existing.clone());
        }
        let store = self.adapter.store(name)?;
        let collection = Arc::new(Collection::new(
            name.to_string(),
            store,
            self.config.collections.clone(),
        ));
        self.collections
            .insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.adapter.list_stores()
    }

    pub async fn drop_collection(&self, name: &str) -> Result<bool> {
        self.collections.remove(name);
        self.adapter.delete_store(name).await
    }

    /// The materialized-view engine
    pub fn views(&self) -> &Arc<ViewManager> {
        &self.views
    }

    /// The branch & snapshot engine
    pub fn branches(&self) -> &Arc<BranchManager> {
        &self.branches
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    /// One forwarding task per collection, no matter how many views
    fn ensure_attached(&self, collection: &Arc<Collection>) {
        if self
            .attached
            .insert(collection.name().to_string(), ())
            .is_none()
        {
            self.views.attach(collection);
        }
    }

    /// Register a view and keep it fed from the collection's change
    /// stream
    pub async fn create_view(
        &self,
        def: ViewDefinition,
    ) -> Result<Arc<view::ProjectedView>> {
        let collection = self.collection(&def.collection)?;
        let view = self.views.create_view(def, &collection).await?;
        self.ensure_attached(&collection);
        Ok(view)
    }

    /// Register a computed view and keep it fed
    pub async fn create_computed_view(
        &self,
        def: ComputedViewDefinition,
    ) -> Result<Arc<view::ComputedView>> {
        let collection = self.collection(&def.collection)?;
        let view = self.views.create_computed_view(def, &collection).await?;
        self.ensure_attached(&collection);
        Ok(view)
    }

    /// Run a closure under an adapter transaction. The transaction rolls
    /// back when the closure errors, and nested calls flatten into the
    /// outermost one.
    pub async fn transaction<F, Fut, T>(
        &self,
        stores: &[&str],
        mode: TransactionMode,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let names: Vec<String> = stores.iter().map(|s| (*s).to_string()).collect();
        let txn = self.adapter.begin(&names, mode).await?;
        match f().await {
            Ok(value) => {
                self.adapter.commit(txn).await?;
                Ok(value)
            }
            Err(e) => {
                // Roll back and surface the original failure.
                let _ = self.adapter.rollback(txn).await;
                Err(e)
            }
        }
    }

    /// Adapter-wide counters
    pub fn stats(&self) -> AdapterStats {
        self.adapter.stats()
    }

    /// Dispose views and close the adapter
    pub async fn close(&self) -> Result<()> {
        self.views.dispose();
        self.adapter.close().await?;
        info!("database closed");
        Ok(())
    }
}
