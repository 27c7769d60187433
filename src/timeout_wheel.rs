//! Maps client id → deadline and extracts expired ids in order (§4.3).
use std::collections::{BTreeSet, HashMap};

/// `id → deadline` map with ascending-deadline extraction.
///
/// Paired `HashMap`/`BTreeSet` mirrors a classic expiration-tracking
/// layout (`expirations: BTreeSet<(Instant, String)>` alongside
/// `entries: HashMap<String, Entry>`): the set keeps `(deadline, id)` pairs
/// sorted so a sweep walks them in order, the map gives O(log n)
/// `update`/`remove` by id without a linear scan of the set.
#[derive(Debug, Default)]
pub struct TimeoutWheel {
    deadlines: HashMap<u64, u64>,
    ordered: BTreeSet<(u64, u64)>,
}

impl TimeoutWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the deadline for `id`.
    pub fn insert(&mut self, id: u64, deadline: u64) {
        self.remove(id);
        self.deadlines.insert(id, deadline);
        self.ordered.insert((deadline, id));
    }

    /// Same as `insert` if `id` is present; a no-op otherwise.
    pub fn update(&mut self, id: u64, deadline: u64) {
        if self.deadlines.contains_key(&id) {
            self.insert(id, deadline);
        }
    }

    /// Removes `id`'s mapping, if any.
    pub fn remove(&mut self, id: u64) {
        if let Some(old_deadline) = self.deadlines.remove(&id) {
            self.ordered.remove(&(old_deadline, id));
        }
    }

    /// `true` if `id` currently has a deadline tracked.
    pub fn contains(&self, id: u64) -> bool {
        self.deadlines.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Removes and returns every id whose deadline is `<= now`, in
    /// nondecreasing deadline order.
    ///
    /// The result is a fully materialized `Vec`, not a lazy generator: by
    /// the time the caller starts acting on entry 0, entries 1..n have
    /// already been removed from the wheel. A caller that re-inserts an id
    /// while processing this batch (e.g. to defer a timeout, §4.3) can only
    /// affect a *future* `extract` call, which is exactly the "must not be
    /// yielded again within the same call" contract.
    pub fn extract(&mut self, now: u64) -> Vec<u64> {
        let expired: Vec<(u64, u64)> = self
            .ordered
            .range(..=(now, u64::MAX))
            .copied()
            .collect();

        let mut ids = Vec::with_capacity(expired.len());
        for (deadline, id) in expired {
            self.ordered.remove(&(deadline, id));
            self.deadlines.remove(&id);
            ids.push(id);
        }
        ids
    }
}
