use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of B-tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeStatsSnapshot {
    /// Number of page searches performed
    pub searches: u64,
    /// Number of keys deserialized from their stored pointers
    pub key_loads: u64,
    /// Number of values deserialized from their stored pointers
    pub value_loads: u64,
    /// Number of child pages materialized from their block ids
    pub child_loads: u64,
    /// Number of dirty pages written to their blocks
    pub page_saves: u64,
    /// Number of LEFT split requests processed
    pub left_splits: u64,
    /// Number of RIGHT split requests processed
    pub right_splits: u64,
    /// Number of root splits (tree height increases)
    pub root_splits: u64,
}

/// Thread-safe statistics tracking for B-tree operations.
#[derive(Default)]
pub struct BTreeStats {
    searches: AtomicU64,
    key_loads: AtomicU64,
    value_loads: AtomicU64,
    child_loads: AtomicU64,
    page_saves: AtomicU64,
    left_splits: AtomicU64,
    right_splits: AtomicU64,
    root_splits: AtomicU64,
}

impl BTreeStats {
    /// Returns the current count of page searches.
    pub fn searches(&self) -> u64 {
        self.searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of key deserializations.
    pub fn key_loads(&self) -> u64 {
        self.key_loads.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of value deserializations.
    pub fn value_loads(&self) -> u64 {
        self.value_loads.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of child page loads.
    pub fn child_loads(&self) -> u64 {
        self.child_loads.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of page saves.
    pub fn page_saves(&self) -> u64 {
        self.page_saves.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of root splits.
    pub fn root_splits(&self) -> u64 {
        self.root_splits.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_searches(&self) {
        self.searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_key_loads(&self) {
        self.key_loads.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_value_loads(&self) {
        self.value_loads.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_child_loads(&self) {
        self.child_loads.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_page_saves(&self) {
        self.page_saves.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_left_splits(&self) {
        self.left_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_right_splits(&self) {
        self.right_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            searches: self.searches(),
            key_loads: self.key_loads(),
            value_loads: self.value_loads(),
            child_loads: self.child_loads(),
            page_saves: self.page_saves(),
            left_splits: self.left_splits.load(AtomicOrdering::Relaxed),
            right_splits: self.right_splits.load(AtomicOrdering::Relaxed),
            root_splits: self.root_splits(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "blocktree::btree::stats",
            searches = snapshot.searches,
            key_loads = snapshot.key_loads,
            value_loads = snapshot.value_loads,
            child_loads = snapshot.child_loads,
            page_saves = snapshot.page_saves,
            left_splits = snapshot.left_splits,
            right_splits = snapshot.right_splits,
            root_splits = snapshot.root_splits,
            "btree stats snapshot"
        );
    }
}
