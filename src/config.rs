//! Configuration for EddyDB

use serde::{Deserialize, Serialize};

/// Main database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Change-stream configuration
    pub changes: ChangeStreamConfig,

    /// Collection defaults
    pub collections: CollectionConfig,

    /// Materialized-view configuration
    pub views: ViewConfig,

    /// Branch & snapshot configuration
    pub branches: BranchConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            changes: ChangeStreamConfig::default(),
            collections: CollectionConfig::default(),
            views: ViewConfig::default(),
            branches: BranchConfig::default(),
        }
    }
}

/// Change-stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeStreamConfig {
    /// Per-subscriber buffered events. A subscriber that falls further
    /// behind than this loses oldest events rather than blocking writers.
    pub buffer_capacity: usize,
}

impl Default for ChangeStreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
        }
    }
}

/// Collection defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Maintain `created_at`/`updated_at` automatically
    pub timestamps: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self { timestamps: true }
    }
}

/// Materialized-view configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewConfig {
    /// Number of recent apply-change timings kept for the rolling average
    pub stats_window: usize,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self { stats_window: 100 }
    }
}

/// Branch & snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Maximum number of live branches (including `main`)
    pub max_branches: usize,

    /// Snapshot retention policy
    pub snapshot_retention: SnapshotRetention,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            max_branches: 32,
            snapshot_retention: SnapshotRetention::Window(64),
        }
    }
}

/// Snapshot retention policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum SnapshotRetention {
    /// Never evict
    KeepAll,
    /// Sliding window; capturing past the limit evicts oldest first
    Window(usize),
}

impl SnapshotRetention {
    pub fn limit(&self) -> Option<usize> {
        match self {
            SnapshotRetention::KeepAll => None,
            SnapshotRetention::Window(n) => Some(*n),
        }
    }
}
