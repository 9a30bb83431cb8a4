//! Storage keys for timeline events.

use serde::{Deserialize, Serialize};

use crate::timeline::direction::Direction;
use crate::timeline::fragment::FragmentId;

/// Lowest event index a fragment can hold.
pub const MIN_EVENT_INDEX: i64 = 0;

/// Neutral midpoint index. The first event written into a fresh fragment
/// lands one step away from here, leaving room to grow in both directions.
pub const MID_EVENT_INDEX: i64 = 1 << 31;

/// Highest event index a fragment can hold.
pub const MAX_EVENT_INDEX: i64 = (1 << 32) - 1;

/// The storage key of one timeline event: `(fragment_id, event_index)`.
///
/// Ordering is lexicographic, but only meaningful between keys of the same
/// fragment; cross-fragment order is the
/// [`FragmentIdComparer`](crate::timeline::comparer::FragmentIdComparer)'s
/// business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub fragment_id: FragmentId,
    pub event_index: i64,
}

impl EventKey {
    pub fn new(fragment_id: FragmentId, event_index: i64) -> Self {
        Self {
            fragment_id,
            event_index,
        }
    }

    /// The neutral key for a fragment that holds no events yet.
    pub fn default_fragment_key(fragment_id: FragmentId) -> Self {
        Self {
            fragment_id,
            event_index: MID_EVENT_INDEX,
        }
    }

    /// The key one step in `direction` from this one, same fragment.
    pub fn next_key_for_direction(self, direction: Direction) -> Self {
        let event_index = match direction {
            Direction::Forward => self.event_index + 1,
            Direction::Backward => self.event_index - 1,
        };
        Self {
            fragment_id: self.fragment_id,
            event_index,
        }
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}]", self.fragment_id, self.event_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_key_is_midpoint() {
        let key = EventKey::default_fragment_key(3);
        assert_eq!(key.fragment_id, 3);
        assert_eq!(key.event_index, MID_EVENT_INDEX);
    }

    #[test]
    fn next_key_moves_by_one() {
        let key = EventKey::default_fragment_key(0);
        let forward = key.next_key_for_direction(Direction::Forward);
        let backward = key.next_key_for_direction(Direction::Backward);
        assert_eq!(forward.event_index, MID_EVENT_INDEX + 1);
        assert_eq!(backward.event_index, MID_EVENT_INDEX - 1);
    }

    #[test]
    fn forward_then_backward_is_identity() {
        let key = EventKey::new(1, 42);
        let roundtrip = key
            .next_key_for_direction(Direction::Forward)
            .next_key_for_direction(Direction::Backward);
        assert_eq!(roundtrip, key);
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(EventKey::new(1, 10) < EventKey::new(1, 11));
        assert!(EventKey::new(1, MAX_EVENT_INDEX) < EventKey::new(2, MIN_EVENT_INDEX));
    }
}
