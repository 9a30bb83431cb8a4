//! Overlap detection between a fetched chunk and stored events.
//!
//! When a pagination chunk contains events that are already on disk, the
//! chunk has run into an existing fragment. The detector splits out the
//! events worth storing and identifies the fragment the duplicate belongs
//! to, so the caller can link it to the fragment being filled.
//!
//! Servers are known to return duplicate event IDs in chunks that are
//! *not* actually the adjacent fragment; the scan therefore keeps going
//! past every duplicate rather than stopping at the first one.

use crate::events::Event;
use crate::storage::{StoreTxn, TimelineEventRow};
use crate::timeline::direction::Direction;
use crate::timeline::fragment::{FragmentBoundaryEntry, FragmentId};
use crate::timeline::{required_event_id, GapError};
use crate::wlog;

/// What a scan found.
#[derive(Debug)]
pub struct OverlapResult {
    /// The chunk minus every event already on disk, in chunk order.
    pub non_overlapping_events: Vec<Event>,
    /// The boundary of the fragment the duplicates belong to, facing back
    /// at the fill point. `None` if no usable neighbour was found.
    pub neighbour_fragment_entry: Option<FragmentBoundaryEntry>,
}

impl OverlapResult {
    pub fn empty() -> Self {
        Self {
            non_overlapping_events: Vec::new(),
            neighbour_fragment_entry: None,
        }
    }
}

/// Scans chunks for events already stored in one room.
pub struct OverlapDetector {
    room_id: String,
}

impl OverlapDetector {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
        }
    }

    /// Scan `chunk` for stored duplicates.
    ///
    /// `current_fragment_id` is the fragment being filled (absent for a
    /// context response, which has no fragment yet); a duplicate that would
    /// link the fragment to itself is discarded with a warning.
    /// `linked_fragment_id` is the fragment already linked beyond the edge
    /// being filled, if any: when set, only its own edge event is accepted
    /// as the neighbour, which keeps spurious duplicates from re-linking an
    /// edge that is already resolved.
    pub fn scan(
        &self,
        current_fragment_id: Option<FragmentId>,
        linked_fragment_id: Option<FragmentId>,
        direction: Direction,
        chunk: &[Event],
        txn: &StoreTxn<'_>,
    ) -> Result<OverlapResult, GapError> {
        if chunk.is_empty() {
            return Ok(OverlapResult::empty());
        }

        // the edge of the linked fragment facing the fill point is its
        // opposite edge
        let expected_overlapping_event_id = match linked_fragment_id {
            Some(linked) => self
                .fragment_edge_event(linked, direction.reverse(), txn)?
                .map(|row| row.event_id),
            None => None,
        };

        let mut non_overlapping_events: Vec<Event> = Vec::new();
        let mut neighbour_fragment_entry: Option<FragmentBoundaryEntry> = None;
        let mut remaining = chunk;

        while !remaining.is_empty() {
            let ids: Vec<&str> = remaining
                .iter()
                .map(required_event_id)
                .collect::<Result<_, _>>()?;
            let duplicate = txn
                .timeline_events()
                .find_first_occurring_event_id(&self.room_id, &ids)?;
            let Some(duplicate_event_id) = duplicate else {
                non_overlapping_events.extend_from_slice(remaining);
                break;
            };
            let duplicate_index = ids
                .iter()
                .position(|id| *id == duplicate_event_id)
                .ok_or_else(|| {
                    GapError::InvariantViolation(format!(
                        "find_first_occurring_event_id returned {duplicate_event_id}, \
                         which is not in the chunk it was given"
                    ))
                })?;
            non_overlapping_events.extend_from_slice(&remaining[..duplicate_index]);

            let is_expected = expected_overlapping_event_id
                .as_deref()
                .map_or(true, |expected| expected == duplicate_event_id);
            if is_expected && neighbour_fragment_entry.is_none() {
                let neighbour_event = txn
                    .timeline_events()
                    .get_by_event_id(&self.room_id, &duplicate_event_id)?
                    .ok_or_else(|| {
                        GapError::InvariantViolation(format!(
                            "stored duplicate {duplicate_event_id} disappeared mid-scan"
                        ))
                    })?;
                let neighbour_fragment_id = neighbour_event.key.fragment_id;
                if current_fragment_id == Some(neighbour_fragment_id) {
                    wlog!(
                        Warn,
                        "prevented self-link of fragment {} in {} via {}",
                        neighbour_fragment_id,
                        crate::logging::room_id(&self.room_id),
                        crate::logging::event_id(&duplicate_event_id)
                    );
                } else {
                    let neighbour_fragment = txn
                        .timeline_fragments()
                        .get(&self.room_id, neighbour_fragment_id)?
                        .ok_or(GapError::UnknownFragment(neighbour_fragment_id))?;
                    neighbour_fragment_entry = Some(FragmentBoundaryEntry::new(
                        neighbour_fragment,
                        direction.reverse(),
                    ));
                }
            }
            // keep scanning past the duplicate either way; the rest of the
            // chunk may hold more spurious duplicates and fresh events
            remaining = &remaining[duplicate_index + 1..];
        }

        Ok(OverlapResult {
            non_overlapping_events,
            neighbour_fragment_entry,
        })
    }

    /// The stored event at a fragment's edge: its first event for
    /// `Backward`, its last for `Forward`. `None` if the fragment holds no
    /// events.
    pub(crate) fn fragment_edge_event(
        &self,
        fragment_id: FragmentId,
        direction: Direction,
        txn: &StoreTxn<'_>,
    ) -> Result<Option<TimelineEventRow>, GapError> {
        let events = match direction {
            Direction::Backward => txn
                .timeline_events()
                .first_events(&self.room_id, fragment_id, 1)?,
            Direction::Forward => txn
                .timeline_events()
                .last_events(&self.room_id, fragment_id, 1)?,
        };
        Ok(events.into_iter().next())
    }
}
