//! Materialized views: registration, change routing and fan-out
//!
//! The manager owns every view, routes change events by collection name,
//! and re-emits view deltas on its own event stream. Incremental state
//! lives in [`projected`] and [`computed`]; this module adds stats,
//! subscriber fan-out and rebuild-on-lag.

pub mod computed;
pub mod projected;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::changes::ChangeEvent;
use crate::collection::Collection;
use crate::config::ViewConfig;
use crate::error::{EddyError, Result};
use crate::query::{self, QuerySpec};
use crate::types::{now_millis, Document};

pub use computed::{
    AggregateKind, AggregateSpec, ComputedDelta, ComputedState, ComputedViewDefinition, GroupRow,
};
pub use projected::{ModifiedPair, ProjectedState, ViewDefinition, ViewDelta};

/// Payload of a `view:updated` event
#[derive(Debug, Clone)]
pub enum ViewUpdate {
    Projected(ViewDelta),
    Computed(ComputedDelta),
}

/// Manager lifecycle events
#[derive(Debug, Clone)]
pub enum ViewEvent {
    Created { name: String },
    Updated { name: String, update: ViewUpdate },
    Dropped { name: String },
}

/// Usage and maintenance statistics for one view
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ViewStats {
    pub result_count: usize,
    pub hits: u64,
    pub avg_update_time_ms: f64,
    pub last_updated: i64,
}

#[derive(Debug)]
struct StatsInner {
    hits: AtomicU64,
    timings: Mutex<VecDeque<f64>>,
    window: usize,
    last_updated: AtomicI64,
}

impl StatsInner {
    fn new(window: usize) -> Self {
        Self {
            hits: AtomicU64::new(0),
            timings: Mutex::new(VecDeque::with_capacity(window)),
            window: window.max(1),
            last_updated: AtomicI64::new(0),
        }
    }

    fn record_apply(&self, elapsed_ms: f64) {
        let mut timings = self.timings.lock();
        if timings.len() == self.window {
            timings.pop_front();
        }
        timings.push_back(elapsed_ms);
        self.last_updated.store(now_millis(), Ordering::Relaxed);
    }

    fn snapshot(&self, result_count: usize) -> ViewStats {
        let timings = self.timings.lock();
        let avg = if timings.is_empty() {
            0.0
        } else {
            timings.iter().sum::<f64>() / timings.len() as f64
        };
        ViewStats {
            result_count,
            hits: self.hits.load(Ordering::Relaxed),
            avg_update_time_ms: avg,
            last_updated: self.last_updated.load(Ordering::Relaxed),
        }
    }
}

/// A registered projected view
pub struct ProjectedView {
    def: ViewDefinition,
    state: RwLock<ProjectedState>,
    stats: StatsInner,
    results_tx: watch::Sender<Vec<Document>>,
}

impl ProjectedView {
    fn new(def: ViewDefinition, initial: Vec<Document>, window: usize) -> Self {
        let state = ProjectedState::seed(initial);
        let (results_tx, _) = watch::channel(project_all(state.results(), &def));
        Self {
            def,
            state: RwLock::new(state),
            stats: StatsInner::new(window),
            results_tx,
        }
    }

    pub fn definition(&self) -> &ViewDefinition {
        &self.def
    }

    /// Current result array, projected
    pub fn results(&self) -> Vec<Document> {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        project_all(self.state.read().results(), &self.def)
    }

    /// Shared, cached results stream; every subscriber sees the same
    /// evaluation. The stream ends when the view is dropped.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Document>> {
        self.results_tx.subscribe()
    }

    pub fn stats(&self) -> ViewStats {
        self.stats.snapshot(self.state.read().len())
    }

    fn apply(&self, event: &ChangeEvent) -> Option<ViewDelta> {
        let started = Instant::now();
        let delta = self.state.write().apply(&self.def, event);
        self.stats
            .record_apply(started.elapsed().as_secs_f64() * 1000.0);
        if delta.is_some() {
            self.results_tx
                .send_replace(project_all(self.state.read().results(), &self.def));
        }
        delta.map(|d| self.project_delta(d))
    }

    fn reseed(&self, results: Vec<Document>) {
        *self.state.write() = ProjectedState::seed(results);
        self.results_tx
            .send_replace(project_all(self.state.read().results(), &self.def));
    }

    fn project_delta(&self, mut delta: ViewDelta) -> ViewDelta {
        let Some(projection) = &self.def.projection else {
            return delta;
        };
        for doc in delta.added.iter_mut().chain(delta.removed.iter_mut()) {
            query::project(doc, projection);
        }
        for pair in &mut delta.modified {
            query::project(&mut pair.before, projection);
            query::project(&mut pair.after, projection);
        }
        delta
    }

    fn spec(&self) -> QuerySpec {
        QuerySpec {
            filter: self.def.filter.clone(),
            sort: self.def.sort.clone(),
            skip: None,
            limit: self.def.limit,
            projection: None,
        }
    }
}

fn project_all(docs: &[Document], def: &ViewDefinition) -> Vec<Document> {
    let mut out = docs.to_vec();
    if let Some(projection) = &def.projection {
        for doc in &mut out {
            query::project(doc, projection);
        }
    }
    out
}

/// A registered computed (group-by) view
#[derive(Debug)]
pub struct ComputedView {
    def: ComputedViewDefinition,
    state: RwLock<ComputedState>,
    stats: StatsInner,
    rows_tx: watch::Sender<Vec<GroupRow>>,
}

impl ComputedView {
    fn new(def: ComputedViewDefinition, initial: Vec<Document>, window: usize) -> Self {
        let mut state = ComputedState::default();
        state.seed(&def, initial);
        let (rows_tx, _) = watch::channel(state.rows(&def));
        Self {
            def,
            state: RwLock::new(state),
            stats: StatsInner::new(window),
            rows_tx,
        }
    }

    pub fn definition(&self) -> &ComputedViewDefinition {
        &self.def
    }

    pub fn rows(&self) -> Vec<GroupRow> {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        self.state.read().rows(&self.def)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<GroupRow>> {
        self.rows_tx.subscribe()
    }

    pub fn stats(&self) -> ViewStats {
        self.stats.snapshot(self.state.read().rows(&self.def).len())
    }

    fn apply(&self, event: &ChangeEvent) -> Option<ComputedDelta> {
        let started = Instant::now();
        let delta = self.state.write().apply(&self.def, event);
        self.stats
            .record_apply(started.elapsed().as_secs_f64() * 1000.0);
        if delta.is_some() {
            self.rows_tx.send_replace(self.state.read().rows(&self.def));
        }
        delta
    }

    fn reseed(&self, docs: Vec<Document>) {
        let mut state = self.state.write();
        state.seed(&self.def, docs);
        self.rows_tx.send_replace(state.rows(&self.def));
    }
}

/// Registry and router for materialized views
pub struct ViewManager {
    config: ViewConfig,
    projected: DashMap<String, Arc<ProjectedView>>,
    computed: DashMap<String, Arc<ComputedView>>,
    events: broadcast::Sender<ViewEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ViewManager {
    pub fn new(config: ViewConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            projected: DashMap::new(),
            computed: DashMap::new(),
            events,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn name_taken(&self, name: &str) -> bool {
        self.projected.contains_key(name) || self.computed.contains_key(name)
    }

    /// Register a projected view, seeding it from the collection's
    /// current contents
    pub async fn create_view(
        &self,
        def: ViewDefinition,
        collection: &Collection,
    ) -> Result<Arc<ProjectedView>> {
        if self.name_taken(&def.name) {
            return Err(EddyError::ConstraintViolation(format!(
                "view already exists: {}",
                def.name
            ))
            .in_op("views.create_view"));
        }
        let spec = QuerySpec {
            filter: def.filter.clone(),
            sort: def.sort.clone(),
            skip: None,
            limit: def.limit,
            projection: None,
        };
        let initial = collection.find(&spec).await?;
        let name = def.name.clone();
        let view = Arc::new(ProjectedView::new(def, initial, self.config.stats_window));
        self.projected.insert(name.clone(), view.clone());
        let _ = self.events.send(ViewEvent::Created { name });
        Ok(view)
    }

    /// Register a computed view, seeding it from the collection's current
    /// contents
    pub async fn create_computed_view(
        &self,
        def: ComputedViewDefinition,
        collection: &Collection,
    ) -> Result<Arc<ComputedView>> {
        if self.name_taken(&def.name) {
            return Err(EddyError::ConstraintViolation(format!(
                "view already exists: {}",
                def.name
            ))
            .in_op("views.create_computed_view"));
        }
        let initial = collection.get_all().await?;
        let name = def.name.clone();
        let view = Arc::new(ComputedView::new(def, initial, self.config.stats_window));
        self.computed.insert(name.clone(), view.clone());
        let _ = self.events.send(ViewEvent::Created { name });
        Ok(view)
    }

    pub fn get_view(&self, name: &str) -> Option<Arc<ProjectedView>> {
        self.projected.get(name).map(|e| e.value().clone())
    }

    pub fn get_computed_view(&self, name: &str) -> Option<Arc<ComputedView>> {
        self.computed.get(name).map(|e| e.value().clone())
    }

    pub fn list_views(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .projected
            .iter()
            .map(|e| e.key().clone())
            .chain(self.computed.iter().map(|e| e.key().clone()))
            .collect();
        names.sort();
        names
    }

    /// Drop a view of either flavor; its results stream terminates
    pub fn drop_view(&self, name: &str) -> bool {
        let dropped = self.projected.remove(name).is_some()
            || self.computed.remove(name).is_some();
        if dropped {
            let _ = self.events.send(ViewEvent::Dropped {
                name: name.to_string(),
            });
        }
        dropped
    }

    /// Subscribe to view lifecycle and delta events
    pub fn events(&self) -> broadcast::Receiver<ViewEvent> {
        self.events.subscribe()
    }

    /// Route one change event to every view registered on the collection.
    /// Deltas are observed in producing-event order per view.
    pub fn process_change(&self, collection: &str, event: &ChangeEvent) {
        for entry in self.projected.iter() {
            let view = entry.value();
            if view.def.collection != collection {
                continue;
            }
            if let Some(delta) = view.apply(event) {
                let _ = self.events.send(ViewEvent::Updated {
                    name: entry.key().clone(),
                    update: ViewUpdate::Projected(delta),
                });
            }
        }
        for entry in self.computed.iter() {
            let view = entry.value();
            if view.def.collection != collection {
                continue;
            }
            if let Some(delta) = view.apply(event) {
                let _ = self.events.send(ViewEvent::Updated {
                    name: entry.key().clone(),
                    update: ViewUpdate::Computed(delta),
                });
            }
        }
    }

    /// Rebuild every view of a collection from scratch. The recovery path
    /// when a change subscription lagged and deltas were lost.
    pub async fn rebuild_collection(&self, collection: &Collection) -> Result<()> {
        let name = collection.name().to_string();
        for entry in self.projected.iter() {
            let view = entry.value();
            if view.def.collection == name {
                let results = collection.find(&view.spec()).await?;
                view.reseed(results);
            }
        }
        for entry in self.computed.iter() {
            let view = entry.value();
            if view.def.collection == name {
                view.reseed(collection.get_all().await?);
            }
        }
        Ok(())
    }

    /// Spawn the forwarding task that keeps this manager fed from a
    /// collection's change stream
    pub fn attach(self: &Arc<Self>, collection: &Collection) {
        let manager = Arc::clone(self);
        let name = collection.name().to_string();
        let store = collection.store().clone();
        let config = crate::config::CollectionConfig::default();
        let mut events = collection.changes();

        let handle = tokio::spawn(async move {
            let reader = Collection::new(name.clone(), store, config);
            loop {
                match events.recv().await {
                    Ok(event) => manager.process_change(&name, &event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(collection = %name, missed, "change stream lagged; rebuilding views");
                        if let Err(e) = manager.rebuild_collection(&reader).await {
                            warn!(collection = %name, error = %e, "view rebuild failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(collection = %name, "view change forwarding stopped");
        });
        self.tasks.lock().push(handle);
    }

    /// Drop every view and stop forwarding tasks
    pub fn dispose(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        let names: Vec<String> = self.list_views();
        self.projected.clear();
        self.computed.clear();
        for name in names {
            let _ = self.events.send(ViewEvent::Dropped { name });
        }
    }
}

impl Drop for ViewManager {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionConfig;
    use crate::query::{Filter, SortSpec};
    use crate::storage::{MemoryAdapter, StorageAdapter};
    use crate::types::Value;

    async fn players() -> Collection {
        let adapter = MemoryAdapter::default();
        adapter.initialize().await.unwrap();
        let store = adapter.store("players").unwrap();
        Collection::new("players".to_string(), store, CollectionConfig::default())
    }

    fn player(id: &str, name: &str, score: i64) -> Document {
        Document::with_id(
            id,
            [
                ("status".to_string(), Value::from("active")),
                ("name".to_string(), Value::from(name)),
                ("score".to_string(), Value::from(score)),
            ]
            .into_iter()
            .collect(),
        )
    }

    #[tokio::test]
    async fn create_seed_and_route() {
        let players = players().await;
        players.insert(player("p1", "Ada", 10)).await.unwrap();

        let manager = Arc::new(ViewManager::new(ViewConfig::default()));
        let view = manager
            .create_view(
                ViewDefinition::new("actives", "players")
                    .with_filter(Filter::eq("status", "active"))
                    .with_sort(SortSpec::asc("name")),
                &players,
            )
            .await
            .unwrap();
        assert_eq!(view.results().len(), 1);

        manager.attach(&players);
        let mut updates = manager.events();
        players.insert(player("p2", "Bob", 20)).await.unwrap();

        loop {
            match updates.recv().await.unwrap() {
                ViewEvent::Updated { name, .. } => {
                    assert_eq!(name, "actives");
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(view.results().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_names_rejected_across_flavors() {
        let players = players().await;
        let manager = ViewManager::new(ViewConfig::default());
        manager
            .create_view(ViewDefinition::new("v", "players"), &players)
            .await
            .unwrap();
        let err = manager
            .create_computed_view(ComputedViewDefinition::new("v", "players"), &players)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_CONSTRAINT");
    }

    #[tokio::test]
    async fn drop_view_terminates_results_stream() {
        let players = players().await;
        let manager = ViewManager::new(ViewConfig::default());
        let view = manager
            .create_view(ViewDefinition::new("v", "players"), &players)
            .await
            .unwrap();
        let mut rx = view.subscribe();
        drop(view);
        assert!(manager.drop_view("v"));

        // Sender gone: the next wait reports closure.
        assert!(rx.changed().await.is_err());
    }

    #[tokio::test]
    async fn stats_track_hits_and_updates() {
        let players = players().await;
        players.insert(player("p1", "Ada", 10)).await.unwrap();
        let manager = ViewManager::new(ViewConfig::default());
        let view = manager
            .create_view(ViewDefinition::new("v", "players"), &players)
            .await
            .unwrap();

        view.results();
        view.results();
        let stats = view.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.result_count, 1);
    }
}
