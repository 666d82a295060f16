//! Interval index over the target's live heap allocations.

use meminterval::{Interval, IntervalTree};

use crate::{SiteTag, TargetAddr};

/// Registry of currently live, allocator-owned byte ranges.
///
/// Ranges are half-open `[start, end)` and carry the site tag of the
/// allocation call that produced them. The tree owns every record; callers
/// only ever see copies of intervals and tags.
#[derive(Debug)]
pub struct AllocTree {
    tree: IntervalTree<TargetAddr, SiteTag>,
}

impl AllocTree {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: IntervalTree::new(),
        }
    }

    /// An arbitrary live interval whose range contains `addr`, or `None`.
    ///
    /// Live allocations do not normally overlap, but if they do (confused
    /// allocator, double tracking) any match is acceptable.
    #[must_use]
    pub fn find_first_overlap(&self, addr: TargetAddr) -> Option<(Interval<TargetAddr>, SiteTag)> {
        self.tree
            .query(addr..=addr)
            .next()
            .map(|entry| (*entry.interval, *entry.value))
    }

    /// Like [`find_first_overlap`](Self::find_first_overlap), but also
    /// matches intervals within `slack` bytes of `addr` on either side, so
    /// that accesses landing just past an allocation still resolve to it.
    #[must_use]
    pub fn find_first_overlap_near(
        &self,
        addr: TargetAddr,
        slack: usize,
    ) -> Option<(Interval<TargetAddr>, SiteTag)> {
        let lo = addr.saturating_sub(slack);
        let hi = addr.saturating_add(slack);
        self.tree
            .query(lo..=hi)
            .next()
            .map(|entry| (*entry.interval, *entry.value))
    }

    /// Records `[start, end)` as live. `start < end` is the caller's
    /// contract; the registry does not enforce uniqueness.
    pub fn insert(&mut self, start: TargetAddr, end: TargetAddr, site: SiteTag) {
        debug_assert!(start < end);
        self.tree.insert(start..end, site);
    }

    /// Drops every interval intersecting `[start, end]`, endpoints
    /// inclusive, so a degenerate `[ptr, ptr]` query still removes the
    /// interval containing `ptr`.
    ///
    /// Matches are collected before the first deletion; removing a node
    /// never invalidates the enumeration of the remaining matches. Removing
    /// zero intervals is a no-op.
    pub fn remove_all_overlapping(&mut self, start: TargetAddr, end: TargetAddr) {
        let mut found = vec![];
        for entry in self.tree.query(start..=end) {
            found.push(*entry.interval);
        }
        for interval in found {
            self.tree.delete(interval);
        }
    }
}

impl Default for AllocTree {
    fn default() -> Self {
        Self::new()
    }
}
