use std::sync::atomic::{AtomicU64, Ordering};

/// A snapshot of the counters a [`BwTree`](crate::BwTree) keeps about its
/// own activity. Counters are shared by every handle of the same tree and
/// are only eventually consistent with each other.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Successful inserts.
    pub inserts: u64,
    /// Successful deletes.
    pub deletes: u64,
    /// Point reads, through either `get_value` or `contains`.
    pub lookups: u64,
    /// Compare-and-swap installs that lost a race and were discarded.
    pub cas_failures: u64,
    /// Delta chains folded into a new base record.
    pub consolidations: u64,
    /// Split deltas installed.
    pub splits: u64,
    /// Pages absorbed by their left sibling and retired.
    pub merges: u64,
    /// Times a new root was installed above a split root.
    pub root_hoists: u64,
    /// Routing entries posted to a parent after a split.
    pub index_terms: u64,
    /// Global epoch advances.
    pub epochs_advanced: u64,
    /// Retired items released by the garbage collector.
    pub reclaimed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) inserts: AtomicU64,
    pub(crate) deletes: AtomicU64,
    pub(crate) lookups: AtomicU64,
    pub(crate) cas_failures: AtomicU64,
    pub(crate) consolidations: AtomicU64,
    pub(crate) splits: AtomicU64,
    pub(crate) merges: AtomicU64,
    pub(crate) root_hoists: AtomicU64,
    pub(crate) index_terms: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub(crate) fn snapshot(&self, epochs_advanced: u64, reclaimed: u64) -> Stats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        Stats {
            inserts: load(&self.inserts),
            deletes: load(&self.deletes),
            lookups: load(&self.lookups),
            cas_failures: load(&self.cas_failures),
            consolidations: load(&self.consolidations),
            splits: load(&self.splits),
            merges: load(&self.merges),
            root_hoists: load(&self.root_hoists),
            index_terms: load(&self.index_terms),
            epochs_advanced,
            reclaimed,
        }
    }
}
