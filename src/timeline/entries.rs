//! Entry values emitted by the timeline writers.
//!
//! Writers return sequences of [`TimelineEntry`] in chronological order:
//! event entries for stored events, boundary entries for the fragment edges
//! that were touched. Callers discriminate on the variant.

use crate::storage::TimelineEventRow;
use crate::timeline::direction::Direction;
use crate::timeline::event_key::EventKey;
use crate::timeline::fragment::{FragmentBoundaryEntry, FragmentId};

/// A stored timeline event, as handed back to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEntry {
    row: TimelineEventRow,
}

impl EventEntry {
    pub fn new(row: TimelineEventRow) -> Self {
        Self { row }
    }

    pub fn key(&self) -> EventKey {
        self.row.key
    }

    pub fn fragment_id(&self) -> FragmentId {
        self.row.key.fragment_id
    }

    pub fn event_id(&self) -> &str {
        &self.row.event_id
    }

    pub fn event(&self) -> &crate::events::Event {
        &self.row.event
    }

    pub fn display_name(&self) -> Option<&str> {
        self.row.display_name.as_deref()
    }

    pub fn avatar_url(&self) -> Option<&str> {
        self.row.avatar_url.as_deref()
    }

    pub fn row(&self) -> &TimelineEventRow {
        &self.row
    }

    pub fn into_row(self) -> TimelineEventRow {
        self.row
    }
}

/// One element of a writer's result sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    Event(EventEntry),
    Boundary(FragmentBoundaryEntry),
}

impl TimelineEntry {
    pub fn as_event(&self) -> Option<&EventEntry> {
        match self {
            TimelineEntry::Event(entry) => Some(entry),
            TimelineEntry::Boundary(_) => None,
        }
    }

    pub fn as_boundary(&self) -> Option<&FragmentBoundaryEntry> {
        match self {
            TimelineEntry::Event(_) => None,
            TimelineEntry::Boundary(entry) => Some(entry),
        }
    }
}

/// Append `value` to `entries` on the side `direction` walks toward:
/// push-back for `Forward`, push-front for `Backward`.
///
/// Writers collect entries in the order they visit them; routing every
/// append through here keeps the result chronological regardless of the
/// fill direction.
pub fn directional_append<T>(entries: &mut Vec<T>, value: T, direction: Direction) {
    match direction {
        Direction::Forward => entries.push(value),
        Direction::Backward => entries.insert(0, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_appends_to_tail() {
        let mut entries = vec![1, 2];
        directional_append(&mut entries, 3, Direction::Forward);
        assert_eq!(entries, vec![1, 2, 3]);
    }

    #[test]
    fn backward_appends_to_head() {
        let mut entries = vec![2, 3];
        directional_append(&mut entries, 1, Direction::Backward);
        assert_eq!(entries, vec![1, 2, 3]);
    }
}
