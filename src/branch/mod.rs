//! Branching and snapshots over copy-on-write document graphs
//!
//! Each branch owns collection maps that share `Arc<Document>` references
//! with its relatives until it writes. Checkout only moves the current
//! pointer; snapshots capture exact contents plus a deterministic
//! checksum per collection.

pub mod merge;
pub mod snapshot;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::BranchConfig;
use crate::error::{EddyError, Result};
use crate::types::{now_millis, Document, DocumentId};

pub use merge::{
    ConflictResolution, ConflictResolver, MergeConflict, MergeResult, MergeStrategy,
};
pub use snapshot::{BranchData, CollectionSnapshot, Snapshot};

/// The immortal initial branch
pub const MAIN_BRANCH: &str = "main";

/// Branch metadata
#[derive(Debug, Clone)]
pub struct Branch {
    pub name: String,
    pub parent: Option<String>,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub creation_snapshot_id: Option<String>,
}

/// Branch lifecycle events
#[derive(Debug, Clone)]
pub enum BranchEvent {
    BranchCreated {
        name: String,
        parent: String,
    },
    CheckedOut {
        name: String,
    },
    BranchDeleted {
        name: String,
    },
    BranchMerged {
        source: String,
        target: String,
        merged_documents: usize,
        conflicts: usize,
    },
    SnapshotCaptured {
        id: String,
        branch: String,
    },
    SnapshotRestored {
        id: String,
        branch: String,
    },
}

/// Options for [`BranchManager::branch`]
#[derive(Debug, Clone, Default)]
pub struct BranchOptions {
    /// Parent branch; defaults to the current branch
    pub from: Option<String>,
    pub description: Option<String>,
}

/// Options for [`BranchManager::merge`]
#[derive(Clone, Default)]
pub struct MergeOptions {
    /// Defaults to [`MergeStrategy::ThreeWay`]
    pub strategy: Option<MergeStrategy>,
    pub resolver: Option<ConflictResolver>,
}

struct BranchInner {
    branches: HashMap<String, Branch>,
    data: HashMap<String, BranchData>,
    current: String,
    snapshots: Vec<Snapshot>,
}

/// Tree of named branches plus their snapshots
pub struct BranchManager {
    config: BranchConfig,
    inner: RwLock<BranchInner>,
    events: broadcast::Sender<BranchEvent>,
}

impl BranchManager {
    pub fn new(config: BranchConfig) -> Self {
        let now = now_millis();
        let mut branches = HashMap::new();
        branches.insert(
            MAIN_BRANCH.to_string(),
            Branch {
                name: MAIN_BRANCH.to_string(),
                parent: None,
                description: None,
                created_at: now,
                updated_at: now,
                creation_snapshot_id: None,
            },
        );
        let mut data = HashMap::new();
        data.insert(MAIN_BRANCH.to_string(), BranchData::new());

        let (events, _) = broadcast::channel(256);
        Self {
            config,
            inner: RwLock::new(BranchInner {
                branches,
                data,
                current: MAIN_BRANCH.to_string(),
                snapshots: Vec::new(),
            }),
            events,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<BranchEvent> {
        self.events.subscribe()
    }

    pub fn current_branch(&self) -> String {
        self.inner.read().current.clone()
    }

    pub fn get_branches(&self) -> Vec<Branch> {
        let mut branches: Vec<Branch> =
            self.inner.read().branches.values().cloned().collect();
        branches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        branches
    }

    pub fn get_snapshots(&self) -> Vec<Snapshot> {
        self.inner.read().snapshots.clone()
    }

    /// Create a branch from a parent (default: the current branch). The
    /// parent's state is captured as the creation snapshot and the data
    /// maps are cloned copy-on-write.
    pub fn branch(&self, name: &str, options: BranchOptions) -> Result<Branch> {
        let mut inner = self.inner.write();
        if inner.branches.contains_key(name) {
            return Err(EddyError::ConstraintViolation(format!(
                "branch already exists: {name}"
            ))
            .in_op("branches.branch"));
        }
        if inner.branches.len() >= self.config.max_branches {
            return Err(EddyError::InvalidArgument(format!(
                "branch limit reached ({})",
                self.config.max_branches
            ))
            .in_op("branches.branch"));
        }
        let parent = options.from.unwrap_or_else(|| inner.current.clone());
        let parent_data = inner
            .data
            .get(&parent)
            .ok_or_else(|| EddyError::not_found("branch", parent.clone()))?
            .clone();

        let creation = Snapshot::capture(&parent, &parent_data, None, None);
        let snapshot_id = creation.id.clone();
        inner.snapshots.push(creation);
        self.enforce_retention(&mut inner);

        let now = now_millis();
        let branch = Branch {
            name: name.to_string(),
            parent: Some(parent.clone()),
            description: options.description,
            created_at: now,
            updated_at: now,
            creation_snapshot_id: Some(snapshot_id),
        };
        inner.branches.insert(name.to_string(), branch.clone());
        inner.data.insert(name.to_string(), parent_data);
        drop(inner);

        info!(branch = name, parent = %parent, "branch created");
        let _ = self.events.send(BranchEvent::BranchCreated {
            name: name.to_string(),
            parent,
        });
        Ok(branch)
    }

    /// Switch the current branch. O(1): only the pointer moves.
    pub fn checkout(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.branches.contains_key(name) {
            return Err(EddyError::not_found("branch", name).in_op("branches.checkout"));
        }
        inner.current = name.to_string();
        if let Some(branch) = inner.branches.get_mut(name) {
            branch.updated_at = now_millis();
        }
        drop(inner);
        let _ = self.events.send(BranchEvent::CheckedOut {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if name == MAIN_BRANCH {
            return Err(
                EddyError::InvalidArgument("main cannot be deleted".to_string())
                    .in_op("branches.delete_branch"),
            );
        }
        if inner.current == name {
            return Err(EddyError::InvalidArgument(
                "cannot delete the current branch".to_string(),
            )
            .in_op("branches.delete_branch"));
        }
        if inner.branches.remove(name).is_none() {
            return Err(EddyError::not_found("branch", name).in_op("branches.delete_branch"));
        }
        inner.data.remove(name);
        drop(inner);
        let _ = self.events.send(BranchEvent::BranchDeleted {
            name: name.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Document access on the current branch
    // ------------------------------------------------------------------

    pub fn put(&self, collection: &str, doc: Document) -> Result<Document> {
        let mut inner = self.inner.write();
        let current = inner.current.clone();
        let data = inner
            .data
            .get_mut(&current)
            .ok_or_else(|| EddyError::not_found("branch", current.clone()))?;
        let id = doc.id.clone();
        data.entry(collection.to_string())
            .or_default()
            .insert(id, Arc::new(doc.clone()));
        if let Some(branch) = inner.branches.get_mut(&current) {
            branch.updated_at = now_millis();
        }
        Ok(doc)
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        let inner = self.inner.read();
        inner
            .data
            .get(&inner.current)
            .and_then(|data| data.get(collection))
            .and_then(|docs| docs.get(id))
            .map(|doc| (**doc).clone())
    }

    pub fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let current = inner.current.clone();
        let data = inner
            .data
            .get_mut(&current)
            .ok_or_else(|| EddyError::not_found("branch", current.clone()))?;
        Ok(data
            .get_mut(collection)
            .map(|docs| docs.remove(id).is_some())
            .unwrap_or(false))
    }

    pub fn get_collection(&self, collection: &str) -> Vec<Document> {
        let inner = self.inner.read();
        inner
            .data
            .get(&inner.current)
            .and_then(|data| data.get(collection))
            .map(|docs| docs.values().map(|d| (**d).clone()).collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Capture the current branch
    pub fn snapshot(&self, label: Option<String>) -> Snapshot {
        let mut inner = self.inner.write();
        let current = inner.current.clone();
        let parent_id = inner
            .snapshots
            .iter()
            .rev()
            .find(|s| s.branch == current)
            .map(|s| s.id.clone());
        let data = inner.data.get(&current).cloned().unwrap_or_default();
        let snap = Snapshot::capture(&current, &data, label, parent_id);
        inner.snapshots.push(snap.clone());
        self.enforce_retention(&mut inner);
        drop(inner);

        let _ = self.events.send(BranchEvent::SnapshotCaptured {
            id: snap.id.clone(),
            branch: snap.branch.clone(),
        });
        snap
    }

    /// Replace the current branch's data with a snapshot's contents
    pub fn restore(&self, snapshot_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let snap = inner
            .snapshots
            .iter()
            .find(|s| s.id == snapshot_id)
            .cloned()
            .ok_or_else(|| {
                EddyError::not_found("snapshot", snapshot_id).in_op("branches.restore")
            })?;
        let current = inner.current.clone();
        inner.data.insert(current.clone(), snap.to_branch_data());
        drop(inner);

        let _ = self.events.send(BranchEvent::SnapshotRestored {
            id: snapshot_id.to_string(),
            branch: current,
        });
        Ok(())
    }

    fn enforce_retention(&self, inner: &mut BranchInner) {
        if let Some(limit) = self.config.snapshot_retention.limit() {
            while inner.snapshots.len() > limit {
                inner.snapshots.remove(0);
            }
        }
    }

    // ------------------------------------------------------------------
    // Diff & merge
    // ------------------------------------------------------------------

    /// Content diff of the current branch against a target branch
    pub fn diff(&self, target: &str) -> Result<BranchDiff> {
        let inner = self.inner.read();
        let ours = inner
            .data
            .get(&inner.current)
            .ok_or_else(|| EddyError::not_found("branch", inner.current.clone()))?;
        let theirs = inner
            .data
            .get(target)
            .ok_or_else(|| EddyError::not_found("branch", target).in_op("branches.diff"))?;
        Ok(diff_data(ours, theirs))
    }

    /// Merge a source branch into the current branch.
    ///
    /// The merge plan is computed without touching branch data; only a
    /// conflict-free (or fully resolved) plan commits. A failed merge
    /// leaves no visible changes.
    pub fn merge(&self, source: &str, options: MergeOptions) -> Result<MergeResult> {
        let started = Instant::now();
        let strategy = options.strategy.unwrap_or(MergeStrategy::ThreeWay);

        let (target, base_data, ours, theirs) = {
            let inner = self.inner.read();
            let target = inner.current.clone();
            if source == target {
                return Err(EddyError::InvalidArgument(
                    "cannot merge a branch into itself".to_string(),
                )
                .in_op("branches.merge"));
            }
            let theirs = inner
                .data
                .get(source)
                .ok_or_else(|| EddyError::not_found("branch", source).in_op("branches.merge"))?
                .clone();
            let ours = inner
                .data
                .get(&target)
                .ok_or_else(|| EddyError::not_found("branch", target.clone()))?
                .clone();
            let base_data = inner
                .branches
                .get(source)
                .and_then(|b| b.creation_snapshot_id.as_ref())
                .and_then(|id| inner.snapshots.iter().find(|s| &s.id == id))
                .map(|s| s.to_branch_data())
                .unwrap_or_default();
            (target, base_data, ours, theirs)
        };

        let mut plan = match strategy {
            MergeStrategy::FastForward => merge::plan_fast_forward(&theirs, &ours),
            MergeStrategy::ThreeWay => merge::plan_three_way(&base_data, &ours, &theirs),
        };

        if !plan.conflicts.is_empty() {
            if let Some(resolver) = &options.resolver {
                let resolutions = resolver(&plan.conflicts);
                merge::apply_resolutions(&mut plan, resolutions);
            }
        }

        let success = plan.conflicts.is_empty();
        let conflicts = plan.conflicts.clone();
        let merged_documents = plan.merged_documents;

        if success && merged_documents > 0 {
            let mut inner = self.inner.write();
            let data = inner
                .data
                .get_mut(&target)
                .ok_or_else(|| EddyError::not_found("branch", target.clone()))?;
            plan.apply(data);
            if let Some(branch) = inner.branches.get_mut(&target) {
                branch.updated_at = now_millis();
            }
        }

        let result = MergeResult {
            strategy,
            success,
            conflicts,
            merged_documents,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let _ = self.events.send(BranchEvent::BranchMerged {
            source: source.to_string(),
            target,
            merged_documents: result.merged_documents,
            conflicts: result.conflicts.len(),
        });
        Ok(result)
    }
}

/// One document-level difference
#[derive(Debug, Clone)]
pub struct DocChange {
    pub collection: String,
    pub document_id: DocumentId,
}

/// Content diff between two branches' data
#[derive(Debug, Clone, Default)]
pub struct BranchDiff {
    pub added: Vec<DocChange>,
    pub modified: Vec<DocChange>,
    pub deleted: Vec<DocChange>,
}

impl BranchDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Differences of `ours` relative to `theirs`
fn diff_data(ours: &BranchData, theirs: &BranchData) -> BranchDiff {
    let mut diff = BranchDiff::default();

    for (collection, docs) in ours {
        for (id, doc) in docs {
            match theirs.get(collection).and_then(|d| d.get(id)) {
                None => diff.added.push(DocChange {
                    collection: collection.clone(),
                    document_id: id.clone(),
                }),
                Some(other) if !doc.same_content(other) => diff.modified.push(DocChange {
                    collection: collection.clone(),
                    document_id: id.clone(),
                }),
                Some(_) => {}
            }
        }
    }
    for (collection, docs) in theirs {
        for id in docs.keys() {
            if ours.get(collection).and_then(|d| d.get(id)).is_none() {
                diff.deleted.push(DocChange {
                    collection: collection.clone(),
                    document_id: id.clone(),
                });
            }
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn doc(id: &str, fields: &[(&str, Value)]) -> Document {
        Document::with_id(
            id,
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn manager() -> BranchManager {
        BranchManager::new(BranchConfig::default())
    }

    #[test]
    fn main_exists_and_cannot_be_deleted() {
        let branches = manager();
        assert_eq!(branches.current_branch(), MAIN_BRANCH);
        assert!(branches.delete_branch(MAIN_BRANCH).is_err());
    }

    #[test]
    fn branch_shares_documents_until_write() {
        let branches = manager();
        branches
            .put("users", doc("u1", &[("name", "Alice".into())]))
            .unwrap();
        branches.branch("feature", BranchOptions::default()).unwrap();

        branches.checkout("feature").unwrap();
        assert_eq!(
            branches.get("users", "u1").unwrap().get("name"),
            Some(&Value::from("Alice"))
        );

        // Writing on the branch leaves main untouched.
        branches
            .put("users", doc("u1", &[("name", "Bob".into())]))
            .unwrap();
        branches.checkout(MAIN_BRANCH).unwrap();
        assert_eq!(
            branches.get("users", "u1").unwrap().get("name"),
            Some(&Value::from("Alice"))
        );
    }

    #[test]
    fn current_branch_cannot_be_deleted() {
        let branches = manager();
        branches.branch("feature", BranchOptions::default()).unwrap();
        branches.checkout("feature").unwrap();
        assert!(branches.delete_branch("feature").is_err());
        branches.checkout(MAIN_BRANCH).unwrap();
        branches.delete_branch("feature").unwrap();
    }

    #[test]
    fn branch_limit_is_enforced() {
        let branches = BranchManager::new(BranchConfig {
            max_branches: 2,
            ..BranchConfig::default()
        });
        branches.branch("one", BranchOptions::default()).unwrap();
        let err = branches
            .branch("two", BranchOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), "E_INVALID_ARGUMENT");
    }

    #[test]
    fn diff_reports_added_modified_deleted() {
        let branches = manager();
        branches.put("users", doc("keep", &[("v", 1.into())])).unwrap();
        branches.put("users", doc("change", &[("v", 1.into())])).unwrap();
        branches.put("users", doc("drop", &[("v", 1.into())])).unwrap();
        branches.branch("feature", BranchOptions::default()).unwrap();
        branches.checkout("feature").unwrap();

        branches.put("users", doc("change", &[("v", 2.into())])).unwrap();
        branches.put("users", doc("fresh", &[("v", 1.into())])).unwrap();
        branches.delete("users", "drop").unwrap();

        let diff = branches.diff(MAIN_BRANCH).unwrap();
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.deleted.len(), 1);
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let branches = manager();
        branches.put("users", doc("u1", &[("v", 1.into())])).unwrap();
        let snap = branches.snapshot(Some("before".to_string()));

        branches.put("users", doc("u1", &[("v", 2.into())])).unwrap();
        branches.restore(&snap.id).unwrap();
        assert_eq!(
            branches.get("users", "u1").unwrap().get("v"),
            Some(&Value::from(1))
        );

        // Restored state re-captures to the same checksum.
        let again = branches.snapshot(None);
        assert_eq!(
            snap.collections["users"].checksum,
            again.collections["users"].checksum
        );
    }

    #[test]
    fn snapshot_retention_evicts_oldest() {
        let branches = BranchManager::new(BranchConfig {
            snapshot_retention: crate::config::SnapshotRetention::Window(2),
            ..BranchConfig::default()
        });
        let first = branches.snapshot(None);
        branches.snapshot(None);
        branches.snapshot(None);
        let ids: Vec<String> = branches.get_snapshots().iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&first.id));
    }

    #[test]
    fn clean_three_way_merge_applies_their_change() {
        let branches = manager();
        branches
            .put("users", doc("u1", &[("name", "Alice".into())]))
            .unwrap();
        branches.branch("feature", BranchOptions::default()).unwrap();

        branches.checkout("feature").unwrap();
        branches
            .put("users", doc("u1", &[("name", "Alice B.".into())]))
            .unwrap();
        branches.checkout(MAIN_BRANCH).unwrap();

        let result = branches.merge("feature", MergeOptions::default()).unwrap();
        assert!(result.success);
        assert!(result.conflicts.is_empty());
        assert_eq!(
            branches.get("users", "u1").unwrap().get("name"),
            Some(&Value::from("Alice B."))
        );
    }

    #[test]
    fn re_merging_applied_changes_is_noop() {
        let branches = manager();
        branches
            .put("users", doc("u1", &[("name", "Alice".into())]))
            .unwrap();
        branches.branch("feature", BranchOptions::default()).unwrap();
        branches.checkout("feature").unwrap();
        branches
            .put("users", doc("u1", &[("name", "Alice B.".into())]))
            .unwrap();
        branches.checkout(MAIN_BRANCH).unwrap();

        branches.merge("feature", MergeOptions::default()).unwrap();
        let second = branches.merge("feature", MergeOptions::default()).unwrap();
        assert!(second.success);
        assert_eq!(second.merged_documents, 0);
    }

    #[test]
    fn conflicting_merge_reports_then_resolves() {
        let branches = manager();
        branches
            .put("users", doc("u1", &[("name", "Alice".into())]))
            .unwrap();
        branches.branch("feature", BranchOptions::default()).unwrap();

        branches.checkout("feature").unwrap();
        branches
            .put("users", doc("u1", &[("name", "Alice B.".into())]))
            .unwrap();
        branches.checkout(MAIN_BRANCH).unwrap();
        branches
            .put("users", doc("u1", &[("name", "Alicia".into())]))
            .unwrap();

        // Without a resolver: one conflict, nothing applied.
        let result = branches.merge("feature", MergeOptions::default()).unwrap();
        assert!(!result.success);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(
            branches.get("users", "u1").unwrap().get("name"),
            Some(&Value::from("Alicia"))
        );

        // With a resolver the merge completes.
        let result = branches
            .merge(
                "feature",
                MergeOptions {
                    strategy: None,
                    resolver: Some(Arc::new(|conflicts: &[MergeConflict]| {
                        conflicts
                            .iter()
                            .map(|c| ConflictResolution {
                                collection: c.collection.clone(),
                                document_id: c.document_id.clone(),
                                field: c.field.clone().unwrap(),
                                value: "Alicia B.".into(),
                            })
                            .collect()
                    })),
                },
            )
            .unwrap();
        assert!(result.success);
        assert_eq!(result.merged_documents, 1);
        assert_eq!(
            branches.get("users", "u1").unwrap().get("name"),
            Some(&Value::from("Alicia B."))
        );
    }

    #[test]
    fn fast_forward_applies_source_over_target() {
        let branches = manager();
        branches.branch("feature", BranchOptions::default()).unwrap();
        branches.checkout("feature").unwrap();
        branches.put("users", doc("u1", &[("v", 1.into())])).unwrap();
        branches.checkout(MAIN_BRANCH).unwrap();

        let result = branches
            .merge(
                "feature",
                MergeOptions {
                    strategy: Some(MergeStrategy::FastForward),
                    resolver: None,
                },
            )
            .unwrap();
        assert!(result.success);
        assert_eq!(result.merged_documents, 1);
        assert!(branches.get("users", "u1").is_some());
    }
}
