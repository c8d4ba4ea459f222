//! Change events and the per-store change stream

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{Document, DocumentId, SequenceNumber};

/// Kind of mutation a change event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// A record of one insert/update/delete on a document store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub document_id: DocumentId,
    /// New document state; `None` for deletes
    pub document: Option<Document>,
    /// Prior state, when one existed
    pub previous: Option<Document>,
    /// Whether this write originated from replication
    pub is_from_sync: bool,
    /// Wall-clock millis at publish time
    pub timestamp: i64,
    /// Per-store, strictly increasing and gap-free
    pub sequence: SequenceNumber,
}

impl ChangeEvent {
    /// The document state relevant for matching: the new document for
    /// inserts/updates, the previous one for deletes.
    pub fn effective(&self) -> Option<&Document> {
        self.document.as_ref().or(self.previous.as_ref())
    }
}

/// Multi-subscriber change stream over one document store.
///
/// Subscribers each get an independent bounded queue; one that lags past
/// the buffer capacity loses oldest events instead of stalling writers,
/// and a panicking or slow subscriber never affects delivery to others.
#[derive(Debug, Clone)]
pub struct ChangeStream {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe; receives every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Publish to all current subscribers. Events are cloned per
    /// subscriber, so observer mutation cannot reach the store.
    pub fn publish(&self, event: ChangeEvent) {
        // Err means no subscribers; not a failure.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
