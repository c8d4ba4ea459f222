//! Snapshots of branch data with deterministic checksums

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{now_millis, Document, DocumentId};
use crate::view::computed::write_canonical;

/// Branch data: collection → id → shared document reference. Cloning the
/// outer maps is the copy-on-write step; documents stay shared until a
/// branch writes.
pub type BranchData = HashMap<String, HashMap<DocumentId, Arc<Document>>>;

/// Captured contents of one collection
#[derive(Debug, Clone)]
pub struct CollectionSnapshot {
    pub doc_count: usize,
    pub docs: HashMap<DocumentId, Arc<Document>>,
    pub checksum: u32,
}

/// Immutable captured state of a branch
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub branch: String,
    pub timestamp: i64,
    pub label: Option<String>,
    pub parent_snapshot_id: Option<String>,
    pub collections: HashMap<String, CollectionSnapshot>,
}

impl Snapshot {
    /// Capture branch data. The checksum is a pure function of document
    /// content: ids are visited in sorted order and each document
    /// contributes its canonical form.
    pub fn capture(
        branch: &str,
        data: &BranchData,
        label: Option<String>,
        parent_snapshot_id: Option<String>,
    ) -> Self {
        let collections = data
            .iter()
            .map(|(name, docs)| {
                (
                    name.clone(),
                    CollectionSnapshot {
                        doc_count: docs.len(),
                        docs: docs.clone(),
                        checksum: checksum_docs(docs),
                    },
                )
            })
            .collect();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            branch: branch.to_string(),
            timestamp: now_millis(),
            label,
            parent_snapshot_id,
            collections,
        }
    }

    /// Rebuild branch data from the captured documents
    pub fn to_branch_data(&self) -> BranchData {
        self.collections
            .iter()
            .map(|(name, snap)| (name.clone(), snap.docs.clone()))
            .collect()
    }
}

/// Deterministic checksum over a collection's documents
pub fn checksum_docs(docs: &HashMap<DocumentId, Arc<Document>>) -> u32 {
    let mut ids: Vec<&DocumentId> = docs.keys().collect();
    ids.sort();

    let mut hasher = crc32fast::Hasher::new();
    for id in ids {
        let doc = &docs[id];
        hasher.update(canonical_document(doc).as_bytes());
    }
    hasher.finalize()
}

/// Canonical single-line form of a document's content: id, tombstone flag
/// and data fields in sorted order. Store-assigned metadata (revision,
/// write times) stays out so equal content always hashes equal.
fn canonical_document(doc: &Document) -> String {
    let mut out = String::new();
    out.push_str("{\"_deleted\":");
    out.push_str(if doc.deleted { "true" } else { "false" });
    out.push_str(",\"_id\":\"");
    out.push_str(&doc.id);
    out.push('"');

    let mut keys: Vec<&String> = doc.data.keys().collect();
    keys.sort();
    for key in keys {
        out.push_str(",\"");
        out.push_str(key);
        out.push_str("\":");
        write_canonical(&doc.data[key], &mut out);
    }
    out.push('}');
    out
}
