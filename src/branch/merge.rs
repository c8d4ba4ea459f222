//! Branch merging: fast-forward and three-way with field-level merge
//!
//! The merge itself is computed purely over `(base, ours, theirs)` data;
//! committing the outcome is the manager's job. Nothing becomes visible
//! until the computed plan is applied, so an abandoned merge leaves no
//! trace.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{Document, Value};

use super::snapshot::BranchData;

/// Merge strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Apply every source document over the target
    FastForward,
    /// Reconcile against the common base, field by field where needed
    ThreeWay,
}

/// An unresolved difference discovered during a three-way merge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConflict {
    pub collection: String,
    pub document_id: String,
    /// `None` marks a document-level conflict (e.g. delete vs. modify)
    pub field: Option<String>,
    pub base: Option<Value>,
    pub ours: Option<Value>,
    pub theirs: Option<Value>,
}

/// A caller-supplied answer to one conflict
#[derive(Debug, Clone)]
pub struct ConflictResolution {
    pub collection: String,
    pub document_id: String,
    pub field: String,
    pub value: Value,
}

/// Conflict resolver callback
pub type ConflictResolver =
    Arc<dyn Fn(&[MergeConflict]) -> Vec<ConflictResolution> + Send + Sync>;

/// Outcome of a merge
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub strategy: MergeStrategy,
    pub success: bool,
    pub conflicts: Vec<MergeConflict>,
    pub merged_documents: usize,
    pub duration_ms: u64,
}

/// One planned write
#[derive(Debug, Clone)]
pub(crate) enum PlannedChange {
    Put(Arc<Document>),
    Delete,
}

/// The computed, not-yet-applied outcome of a merge
#[derive(Debug, Default)]
pub(crate) struct MergePlan {
    pub changes: HashMap<String, HashMap<String, PlannedChange>>,
    pub conflicts: Vec<MergeConflict>,
    pub merged_documents: usize,
}

impl MergePlan {
    fn record(&mut self, collection: &str, id: &str, change: PlannedChange) {
        self.changes
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), change);
        self.merged_documents += 1;
    }

    /// Apply to target data in place
    pub fn apply(self, target: &mut BranchData) -> usize {
        let mut applied = 0;
        for (collection, changes) in self.changes {
            let docs = target.entry(collection).or_default();
            for (id, change) in changes {
                match change {
                    PlannedChange::Put(doc) => {
                        docs.insert(id, doc);
                    }
                    PlannedChange::Delete => {
                        docs.remove(&id);
                    }
                }
                applied += 1;
            }
        }
        applied
    }
}

fn get<'a>(data: &'a BranchData, collection: &str, id: &str) -> Option<&'a Arc<Document>> {
    data.get(collection).and_then(|docs| docs.get(id))
}

fn same(a: Option<&Arc<Document>>, b: Option<&Arc<Document>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x.same_content(y),
        _ => false,
    }
}

/// Every `(collection, id)` across the three data sets
fn all_keys(sets: [&BranchData; 3]) -> BTreeSet<(String, String)> {
    let mut keys = BTreeSet::new();
    for data in sets {
        for (collection, docs) in data {
            for id in docs.keys() {
                keys.insert((collection.clone(), id.clone()));
            }
        }
    }
    keys
}

/// Plan a fast-forward merge: every source document wins
pub(crate) fn plan_fast_forward(theirs: &BranchData, ours: &BranchData) -> MergePlan {
    let mut plan = MergePlan::default();
    for (collection, docs) in theirs {
        for (id, doc) in docs {
            let unchanged = get(ours, collection, id)
                .map(|existing| existing.same_content(doc))
                .unwrap_or(false);
            if !unchanged {
                plan.record(collection, id, PlannedChange::Put(doc.clone()));
            }
        }
    }
    plan
}

/// Plan a three-way merge of `theirs` (source) into `ours` (target) over
/// the shared `base`
pub(crate) fn plan_three_way(
    base: &BranchData,
    ours: &BranchData,
    theirs: &BranchData,
) -> MergePlan {
    let mut plan = MergePlan::default();

    for (collection, id) in all_keys([base, ours, theirs]) {
        let b = get(base, &collection, &id);
        let o = get(ours, &collection, &id);
        let t = get(theirs, &collection, &id);

        if same(o, t) {
            continue;
        }
        if same(o, b) {
            // Only they changed: take theirs.
            match t {
                Some(doc) => plan.record(&collection, &id, PlannedChange::Put(doc.clone())),
                None => plan.record(&collection, &id, PlannedChange::Delete),
            }
            continue;
        }
        if same(t, b) {
            // Only we changed: keep ours.
            continue;
        }

        // Both sides diverged from base.
        match (o, t) {
            (Some(o), Some(t)) => merge_fields(&mut plan, &collection, &id, b, o, t),
            // Delete on one side against edits on the other cannot be
            // reconciled per field.
            _ => plan.conflicts.push(MergeConflict {
                collection: collection.clone(),
                document_id: id.clone(),
                field: None,
                base: b.map(|d| doc_value(d)),
                ours: o.map(|d| doc_value(d)),
                theirs: t.map(|d| doc_value(d)),
            }),
        }
    }
    plan
}

fn doc_value(doc: &Document) -> Value {
    Value::Object(doc.data.clone())
}

/// Merge two diverged documents field by field: each field takes the side
/// that changed from base; both-changed-differently records a conflict.
fn merge_fields(
    plan: &mut MergePlan,
    collection: &str,
    id: &str,
    base: Option<&Arc<Document>>,
    ours: &Arc<Document>,
    theirs: &Arc<Document>,
) {
    let empty = HashMap::new();
    let base_data = base.map(|d| &d.data).unwrap_or(&empty);

    let mut fields: BTreeSet<&String> = base_data.keys().collect();
    fields.extend(ours.data.keys());
    fields.extend(theirs.data.keys());

    let mut merged = (**ours).clone();
    let mut conflicted = false;

    for field in fields {
        let b = base_data.get(field);
        let o = ours.data.get(field);
        let t = theirs.data.get(field);

        if o == t {
            continue;
        }
        if o == b {
            // They changed this field.
            match t {
                Some(value) => {
                    merged.data.insert(field.clone(), value.clone());
                }
                None => {
                    merged.data.remove(field);
                }
            }
        } else if t == b {
            // We changed it; `merged` already carries our value.
        } else {
            conflicted = true;
            plan.conflicts.push(MergeConflict {
                collection: collection.to_string(),
                document_id: id.to_string(),
                field: Some(field.clone()),
                base: b.cloned(),
                ours: o.cloned(),
                theirs: t.cloned(),
            });
        }
    }

    if !conflicted {
        plan.record(collection, id, PlannedChange::Put(Arc::new(merged)));
    } else {
        // Park the partially merged document; resolutions may complete it.
        plan.changes
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), PlannedChange::Put(Arc::new(merged)));
    }
}

/// Fold caller resolutions into the plan, discharging matching conflicts
pub(crate) fn apply_resolutions(plan: &mut MergePlan, resolutions: Vec<ConflictResolution>) {
    for resolution in resolutions {
        let matched = plan.conflicts.iter().position(|c| {
            c.collection == resolution.collection
                && c.document_id == resolution.document_id
                && c.field.as_deref() == Some(resolution.field.as_str())
        });
        let Some(index) = matched else {
            continue;
        };
        plan.conflicts.remove(index);

        let entry = plan
            .changes
            .entry(resolution.collection.clone())
            .or_default()
            .entry(resolution.document_id.clone());
        let entry = entry.or_insert_with(|| {
            PlannedChange::Put(Arc::new(Document::with_id(
                resolution.document_id.clone(),
                HashMap::new(),
            )))
        });
        if let PlannedChange::Put(doc) = entry {
            let mut updated = (**doc).clone();
            updated.data.insert(resolution.field, resolution.value);
            *doc = Arc::new(updated);
        }
        plan.merged_documents += 1;
    }
}
