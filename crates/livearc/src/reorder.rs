//! Reorder buffer: holds completed fragments until their predecessor has been
//! committed, so output is strictly ordered regardless of completion order.

use std::collections::BTreeMap;

/// Result of offering an item to the buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    Accepted,
    /// Already committed; the item is handed back for cleanup.
    Stale(T),
    /// A copy with this sequence number is already waiting.
    Duplicate(T),
}

#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReorderBuffer<T> {
    pub fn new(next: u64) -> Self {
        Self {
            next,
            pending: BTreeMap::new(),
        }
    }

    /// Sequence number the next commit must carry.
    pub fn next_expected(&self) -> u64 {
        self.next
    }

    pub fn insert(&mut self, seq: u64, item: T) -> Admission<T> {
        if seq < self.next {
            return Admission::Stale(item);
        }
        if self.pending.contains_key(&seq) {
            return Admission::Duplicate(item);
        }
        self.pending.insert(seq, item);
        Admission::Accepted
    }

    /// The item that can be committed right now, if it has arrived.
    pub fn peek_next(&self) -> Option<&T> {
        self.pending.get(&self.next)
    }

    /// Remove the committable item and advance.
    pub fn take_next(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.pending.contains_key(&seq)
    }

    pub fn get(&self, seq: u64) -> Option<&T> {
        self.pending.get(&seq)
    }

    /// Everything still waiting, in sequence order.
    pub fn drain(&mut self) -> std::collections::btree_map::IntoIter<u64, T> {
        std::mem::take(&mut self.pending).into_iter()
    }
}

/// The highest sequence number known to exist. Never moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveEdge(Option<u64>);

impl LiveEdge {
    pub fn new(initial: Option<u64>) -> Self {
        Self(initial)
    }

    pub fn get(self) -> Option<u64> {
        self.0
    }

    /// Returns `true` when the edge advanced.
    pub fn observe(&mut self, reported: Option<u64>) -> bool {
        match (self.0, reported) {
            (_, None) => false,
            (Some(current), Some(seq)) if seq <= current => false,
            (_, Some(seq)) => {
                self.0 = Some(seq);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn commit_all(buffer: &mut ReorderBuffer<Vec<u8>>, out: &mut Vec<u8>) {
        while let Some(chunk) = buffer.take_next() {
            out.extend_from_slice(&chunk);
        }
    }

    #[test]
    fn out_of_order_completions_commit_in_order() {
        let mut buffer = ReorderBuffer::new(0);
        let mut out = Vec::new();
        for seq in [2u64, 0, 4, 1, 3, 5] {
            assert_eq!(buffer.insert(seq, vec![seq as u8]), Admission::Accepted);
            commit_all(&mut buffer, &mut out);
        }
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(buffer.next_expected(), 6);
        assert!(buffer.is_empty());
    }

    #[test]
    fn rejects_stale_and_duplicate() {
        let mut buffer = ReorderBuffer::new(5);
        assert_eq!(buffer.insert(4, "old"), Admission::Stale("old"));
        assert_eq!(buffer.insert(7, "a"), Admission::Accepted);
        assert_eq!(buffer.insert(7, "b"), Admission::Duplicate("b"));
        assert_eq!(buffer.get(7), Some(&"a"));
        assert!(buffer.peek_next().is_none());
        assert_eq!(buffer.drain().collect::<Vec<_>>(), vec![(7, "a")]);
    }

    #[test]
    fn live_edge_ignores_lower_and_absent_reports() {
        let mut edge = LiveEdge::new(None);
        assert!(!edge.observe(None));
        assert!(edge.observe(Some(10)));
        assert!(!edge.observe(Some(3)));
        assert!(!edge.observe(None));
        assert!(!edge.observe(Some(10)));
        assert_eq!(edge.get(), Some(10));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Any completion order, including repeated deliveries, yields the
        /// sorted concatenation with each fragment exactly once.
        #[test]
        fn prop_any_order_commits_sorted_once(
            deliveries in proptest::collection::vec(0u64..40, 0..20).prop_flat_map(|repeats| {
                let mut all: Vec<u64> = (0..40).collect();
                all.extend(repeats);
                Just(all).prop_shuffle()
            }),
        ) {
            let mut buffer = ReorderBuffer::new(0);
            let mut out = Vec::new();
            for seq in deliveries {
                let _ = buffer.insert(seq, vec![seq as u8]);
                commit_all(&mut buffer, &mut out);
            }
            let expected: Vec<u8> = (0u8..40).collect();
            prop_assert_eq!(out, expected);
            prop_assert!(buffer.is_empty());
        }

        #[test]
        fn prop_live_edge_is_monotonic(
            reports in proptest::collection::vec(proptest::option::of(0u64..1000), 0..64),
        ) {
            let mut edge = LiveEdge::default();
            let mut previous = None;
            for report in reports {
                edge.observe(report);
                prop_assert!(edge.get() >= previous);
                previous = edge.get();
            }
        }
    }
}
