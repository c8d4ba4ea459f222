//! Incremental maintenance of filter + sort + limit views
//!
//! Delta application is a pure function of `(state, event)`; the
//! surrounding manager owns subscriber fan-out. Keeping the state machine
//! pure lets the reference-recompute property be tested directly.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::changes::{ChangeEvent, ChangeOperation};
use crate::query::{compare_documents, sort_key, Filter, Projection, SortSpec};
use crate::types::{Document, DocumentId};

/// Definition of a projected view
#[derive(Debug, Clone)]
pub struct ViewDefinition {
    pub name: String,
    pub collection: String,
    pub filter: Option<Filter>,
    pub sort: Vec<SortSpec>,
    pub limit: Option<usize>,
    pub projection: Option<Projection>,
}

impl ViewDefinition {
    pub fn new(name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            filter: None,
            sort: Vec::new(),
            limit: None,
            projection: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    fn matches(&self, doc: &Document) -> bool {
        !doc.deleted && self.filter.as_ref().map(|f| f.matches(doc)).unwrap_or(true)
    }
}

/// A before/after pair for an in-place modification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifiedPair {
    pub before: Document,
    pub after: Document,
}

/// How one change event moved a view
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewDelta {
    pub added: Vec<Document>,
    pub removed: Vec<Document>,
    pub modified: Vec<ModifiedPair>,
}

impl ViewDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Materialized result state: an ordered array and the id-set mirroring it
#[derive(Debug, Default)]
pub struct ProjectedState {
    results: Vec<Document>,
    members: HashSet<DocumentId>,
}

impl ProjectedState {
    /// Build from a full evaluation (documents already filtered, sorted
    /// and limited)
    pub fn seed(results: Vec<Document>) -> Self {
        let members = results.iter().map(|d| d.id.clone()).collect();
        Self { results, members }
    }

    pub fn results(&self) -> &[Document] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Apply one change event; returns the delta, or `None` when the view
    /// is unaffected.
    pub fn apply(&mut self, def: &ViewDefinition, event: &ChangeEvent) -> Option<ViewDelta> {
        let id = &event.document_id;
        let was_member = self.members.contains(id);
        let incoming = match event.operation {
            ChangeOperation::Delete => None,
            _ => event.document.as_ref(),
        };
        let now_matches = incoming.map(|d| def.matches(d)).unwrap_or(false);

        match (was_member, now_matches) {
            (false, false) => None,
            (false, true) => self.insert_candidate(def, incoming.unwrap().clone()),
            (true, false) => self.remove_member(id),
            (true, true) => {
                let incoming = incoming.unwrap();
                let position = self.position_of(id)?;
                let keys_changed = sort_key(&self.results[position], &def.sort)
                    != sort_key(incoming, &def.sort);
                if keys_changed {
                    // Position may change: remove and re-insert, folding
                    // both motions into one delta.
                    let before = self.results.remove(position);
                    self.members.remove(id);
                    match self.insert_candidate(def, incoming.clone()) {
                        Some(_) => Some(ViewDelta {
                            modified: vec![ModifiedPair {
                                before,
                                after: incoming.clone(),
                            }],
                            ..ViewDelta::default()
                        }),
                        // Re-insert fell past the limit boundary.
                        None => Some(ViewDelta {
                            removed: vec![before],
                            ..ViewDelta::default()
                        }),
                    }
                } else {
                    let before =
                        std::mem::replace(&mut self.results[position], incoming.clone());
                    Some(ViewDelta {
                        modified: vec![ModifiedPair {
                            before,
                            after: incoming.clone(),
                        }],
                        ..ViewDelta::default()
                    })
                }
            }
        }
    }

    /// Insert a matching document at its sort position, honoring the
    /// limit. A candidate ordering greater-or-equal to the current tail of
    /// a full view is dropped; otherwise the tail is evicted.
    fn insert_candidate(&mut self, def: &ViewDefinition, doc: Document) -> Option<ViewDelta> {
        let mut delta = ViewDelta::default();

        if let Some(limit) = def.limit {
            if limit == 0 {
                return None;
            }
            if self.results.len() >= limit {
                let tail = self.results.last().expect("non-empty at limit");
                if compare_documents(&doc, tail, &def.sort) != Ordering::Less {
                    return None;
                }
                let evicted = self.results.pop().expect("non-empty at limit");
                self.members.remove(&evicted.id);
                delta.removed.push(evicted);
            }
        }

        // Upper bound: an incoming tie lands after existing ties.
        let position = self
            .results
            .partition_point(|existing| {
                compare_documents(existing, &doc, &def.sort) != Ordering::Greater
            });
        self.members.insert(doc.id.clone());
        delta.added.push(doc.clone());
        self.results.insert(position, doc);
        Some(delta)
    }

    fn remove_member(&mut self, id: &str) -> Option<ViewDelta> {
        let position = self.position_of(id)?;
        let removed = self.results.remove(position);
        self.members.remove(id);
        Some(ViewDelta {
            removed: vec![removed],
            ..ViewDelta::default()
        })
    }

    fn position_of(&self, id: &str) -> Option<usize> {
        self.results.iter().position(|d| d.id == id)
    }
}
