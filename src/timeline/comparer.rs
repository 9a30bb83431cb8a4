//! Dynamic partial order over fragment IDs.
//!
//! Fragment IDs are assigned in creation order, which says nothing about
//! timeline order: a fragment created by a jump into old history has a high
//! ID but sorts before the live fragment. The comparer derives timeline
//! order from the fragment links instead. Fragments connected by links form
//! an *island*; within one island every fragment has a rank, and comparison
//! is rank comparison. Fragments in different islands are incomparable
//! until a link joins their islands.
//!
//! The comparer is process-wide shared state: it must only be fed the
//! changed-fragment list of a write operation *after* that operation's
//! transaction committed, never before.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::timeline::fragment::{Fragment, FragmentId};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareError {
    UnknownFragment(FragmentId),
    /// The two fragments are not in the same linked chain (yet).
    Unrelated(FragmentId, FragmentId),
}

impl std::fmt::Display for CompareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompareError::UnknownFragment(id) => write!(f, "unknown fragment: {id}"),
            CompareError::Unrelated(a, b) => {
                write!(f, "fragments {a} and {b} are not in the same chain")
            }
        }
    }
}

impl std::error::Error for CompareError {}

// ---------------------------------------------------------------------------
// Comparer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct FragmentLinks {
    previous_id: Option<FragmentId>,
    next_id: Option<FragmentId>,
}

/// Partial order over the fragments of one room.
#[derive(Debug, Default)]
pub struct FragmentIdComparer {
    links: HashMap<FragmentId, FragmentLinks>,
    /// fragment → (island, rank within island).
    positions: HashMap<FragmentId, (u64, usize)>,
    next_island: u64,
}

impl FragmentIdComparer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a comparer from all fragments of a room, as loaded at startup.
    pub fn from_fragments<'a>(fragments: impl IntoIterator<Item = &'a Fragment>) -> Self {
        let mut comparer = Self::new();
        comparer.add_fragments(fragments);
        comparer
    }

    /// Compare two fragment IDs by timeline order.
    ///
    /// `Err(Unrelated)` means the fragments are not known to be connected;
    /// callers must treat that as "order unknown", not as equality.
    pub fn compare(&self, a: FragmentId, b: FragmentId) -> Result<Ordering, CompareError> {
        if a == b {
            return Ok(Ordering::Equal);
        }
        let &(island_a, rank_a) = self
            .positions
            .get(&a)
            .ok_or(CompareError::UnknownFragment(a))?;
        let &(island_b, rank_b) = self
            .positions
            .get(&b)
            .ok_or(CompareError::UnknownFragment(b))?;
        if island_a != island_b {
            return Err(CompareError::Unrelated(a, b));
        }
        Ok(rank_a.cmp(&rank_b))
    }

    /// Whether the comparer knows this fragment at all.
    pub fn contains(&self, id: FragmentId) -> bool {
        self.positions.contains_key(&id)
    }

    /// Ingest changed fragments (the `fragments` list of a committed write
    /// operation) and re-rank every chain one of them belongs to.
    ///
    /// Only touched chains are walked; islands that contain none of the
    /// changed fragments keep their existing ranks.
    pub fn add_fragments<'a>(&mut self, fragments: impl IntoIterator<Item = &'a Fragment>) {
        let mut seeds = Vec::new();
        for fragment in fragments {
            self.links.insert(
                fragment.id,
                FragmentLinks {
                    previous_id: fragment.previous_id,
                    next_id: fragment.next_id,
                },
            );
            seeds.push(fragment.id);
        }
        let mut rebuilt = HashSet::new();
        for seed in seeds {
            if !rebuilt.contains(&seed) {
                self.rebuild_chain(seed, &mut rebuilt);
            }
        }
    }

    /// Walk the chain containing `seed` to its oldest member, then assign a
    /// fresh island ID and ascending ranks front to back. A visited set
    /// guards the walk: a corrupt cyclic chain terminates instead of
    /// looping.
    fn rebuild_chain(&mut self, seed: FragmentId, rebuilt: &mut HashSet<FragmentId>) {
        let mut head = seed;
        let mut seen = HashSet::new();
        seen.insert(head);
        while let Some(previous) = self.links.get(&head).and_then(|l| l.previous_id) {
            if !self.links.contains_key(&previous) || !seen.insert(previous) {
                break;
            }
            head = previous;
        }

        let island = self.next_island;
        self.next_island += 1;
        let mut rank = 0;
        let mut current = head;
        let mut walked = HashSet::new();
        walked.insert(current);
        loop {
            self.positions.insert(current, (island, rank));
            rebuilt.insert(current);
            rank += 1;
            match self.links.get(&current).and_then(|l| l.next_id) {
                Some(next) if self.links.contains_key(&next) && walked.insert(next) => {
                    current = next;
                }
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(
        id: FragmentId,
        previous_id: Option<FragmentId>,
        next_id: Option<FragmentId>,
    ) -> Fragment {
        let mut fragment = Fragment::new(id, "!room:hs");
        fragment.previous_id = previous_id;
        fragment.next_id = next_id;
        fragment
    }

    #[test]
    fn equal_ids_compare_equal() {
        let comparer = FragmentIdComparer::from_fragments([&fragment(0, None, None)]);
        assert_eq!(comparer.compare(0, 0), Ok(Ordering::Equal));
    }

    #[test]
    fn unknown_fragment_is_an_error() {
        let comparer = FragmentIdComparer::new();
        assert_eq!(
            comparer.compare(0, 1),
            Err(CompareError::UnknownFragment(0))
        );
    }

    #[test]
    fn unlinked_fragments_are_unrelated() {
        let comparer =
            FragmentIdComparer::from_fragments([
                &fragment(0, None, None),
                &fragment(1, None, None),
            ]);
        assert_eq!(comparer.compare(0, 1), Err(CompareError::Unrelated(0, 1)));
    }

    #[test]
    fn linked_chain_orders_by_position_not_id() {
        // A jump into old history created fragment 2, later linked as the
        // oldest: 2 -> 0 -> 1.
        let comparer = FragmentIdComparer::from_fragments([
            &fragment(2, None, Some(0)),
            &fragment(0, Some(2), Some(1)),
            &fragment(1, Some(0), None),
        ]);
        assert_eq!(comparer.compare(2, 0), Ok(Ordering::Less));
        assert_eq!(comparer.compare(0, 1), Ok(Ordering::Less));
        assert_eq!(comparer.compare(1, 2), Ok(Ordering::Greater));
    }

    #[test]
    fn linking_merges_islands() {
        let mut comparer =
            FragmentIdComparer::from_fragments([
                &fragment(0, None, None),
                &fragment(1, None, None),
            ]);
        assert!(comparer.compare(0, 1).is_err());

        // A backfill proved fragment 0 precedes fragment 1.
        comparer.add_fragments([&fragment(0, None, Some(1)), &fragment(1, Some(0), None)]);
        assert_eq!(comparer.compare(0, 1), Ok(Ordering::Less));
    }

    #[test]
    fn untouched_islands_keep_their_order() {
        let mut comparer = FragmentIdComparer::from_fragments([
            &fragment(0, None, Some(1)),
            &fragment(1, Some(0), None),
            &fragment(5, None, None),
        ]);
        comparer.add_fragments([&fragment(5, None, Some(6)), &fragment(6, Some(5), None)]);
        // the 0-1 chain was not touched
        assert_eq!(comparer.compare(0, 1), Ok(Ordering::Less));
        assert_eq!(comparer.compare(5, 6), Ok(Ordering::Less));
        assert!(comparer.compare(0, 5).is_err());
    }

    #[test]
    fn cyclic_links_terminate() {
        // Corrupt input: 0 -> 1 -> 0. The walk must stop, not spin.
        let comparer = FragmentIdComparer::from_fragments([
            &fragment(0, Some(1), Some(1)),
            &fragment(1, Some(0), Some(0)),
        ]);
        assert!(comparer.contains(0));
        assert!(comparer.contains(1));
    }
}
