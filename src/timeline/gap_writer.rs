//! Writing pagination responses into the timeline graph.

use crate::events::{ContextResponse, Event, MessagesResponse};
use crate::relations::RelationWriter;
use crate::storage::StoreTxn;
use crate::timeline::direction::Direction;
use crate::timeline::entries::{EventEntry, TimelineEntry};
use crate::timeline::event_key::EventKey;
use crate::timeline::fragment::{Fragment, FragmentBoundaryEntry};
use crate::timeline::inserter::EventInserter;
use crate::timeline::linker::FragmentLinker;
use crate::timeline::overlap::{OverlapDetector, OverlapResult};
use crate::timeline::{required_event_id, GapError};
use crate::wlog;

/// The outcome of one gap fill or context write.
///
/// `fragments` lists every fragment whose links changed; the caller feeds
/// them to the
/// [`FragmentIdComparer`](crate::timeline::comparer::FragmentIdComparer)
/// after committing the transaction, never before.
#[derive(Debug, Default)]
pub struct GapFillResult {
    /// New timeline entries in chronological order: stored events plus the
    /// fragment boundaries that were touched.
    pub entries: Vec<TimelineEntry>,
    /// Previously stored events whose relation bookkeeping changed.
    pub updated_entries: Vec<EventEntry>,
    /// Fragments to hand to the fragment ID comparer after commit.
    pub fragments: Vec<Fragment>,
    /// For a context write: the entry of the event the context was
    /// requested for.
    pub context_event: Option<EventEntry>,
}

/// Writes `/messages` and `/context` responses for one room.
///
/// Every call runs inside a caller-provided transaction and never commits;
/// a failed call leaves storage untouched once the caller drops the
/// transaction.
pub struct GapWriter {
    room_id: String,
    relation_writer: RelationWriter,
}

impl GapWriter {
    pub fn new(room_id: impl Into<String>, relation_writer: RelationWriter) -> Self {
        Self {
            room_id: room_id.into(),
            relation_writer,
        }
    }

    /// Fill the gap at `fragment_entry` with a raw `/messages` response.
    ///
    /// The response shape is validated first; then the fragment is
    /// reloaded from storage (another transaction may have changed it
    /// since the request was made) and the response is rejected as stale
    /// unless its `start` token still matches the fragment's. An empty
    /// chunk marks the edge of history.
    pub fn write_fragment_fill(
        &self,
        fragment_entry: &FragmentBoundaryEntry,
        response: &serde_json::Value,
        txn: &StoreTxn<'_>,
    ) -> Result<GapFillResult, GapError> {
        let response = MessagesResponse::from_json(response)?;
        let direction = fragment_entry.direction();
        let fragment_id = fragment_entry.fragment_id();

        let fragment = txn
            .timeline_fragments()
            .get(&self.room_id, fragment_id)?
            .ok_or(GapError::UnknownFragment(fragment_id))?;
        let mut fragment_entry = fragment_entry.with_updated_fragment(fragment);

        if fragment_entry.token() != Some(response.start.as_str()) {
            return Err(GapError::StaleToken {
                expected: fragment_entry.token().map(str::to_string),
                got: response.start.clone(),
            });
        }

        if response.chunk.is_empty() {
            fragment_entry.set_edge_reached();
            txn.timeline_fragments().update(fragment_entry.fragment())?;
            return Ok(GapFillResult {
                entries: vec![TimelineEntry::Boundary(fragment_entry)],
                ..GapFillResult::default()
            });
        }

        let detector = OverlapDetector::new(&self.room_id);
        let last_key = self.fragment_edge_event_key(&detector, &fragment_entry, txn)?;
        let overlap = detector.scan(
            Some(fragment_id),
            fragment_entry.linked_fragment_id(),
            direction,
            &response.chunk,
            txn,
        )?;

        let mut end = response.end.clone();
        if overlap.non_overlapping_events.is_empty()
            && overlap.neighbour_fragment_entry.is_none()
            && end.is_some()
        {
            // the server handed back only events we already have and no
            // identifiable neighbour; paginating from `end` would fetch
            // the same chunk forever
            wlog!(
                Warn,
                "chunk for {} overlapped completely with no neighbour, clearing end token",
                crate::logging::room_id(&self.room_id)
            );
            end = None;
        }

        let inserter = EventInserter::new(&self.room_id, &self.relation_writer);
        let stored = inserter.store_events(
            &overlap.non_overlapping_events,
            last_key,
            direction,
            &response.state,
            txn,
        )?;

        let mut entries: Vec<TimelineEntry> =
            stored.entries.into_iter().map(TimelineEntry::Event).collect();
        let fragments = FragmentLinker::new(&self.room_id).update_fragments(
            fragment_entry,
            overlap.neighbour_fragment_entry,
            end,
            &mut entries,
            txn,
        )?;

        Ok(GapFillResult {
            entries,
            updated_entries: stored.updated_entries,
            fragments,
            context_event: None,
        })
    }

    /// Materialize a raw `/context` response: the requested event plus
    /// some history on each side.
    ///
    /// Both sides are scanned for overlap with stored fragments. If either
    /// side runs into one, that fragment is extended; if both do, the two
    /// fragments are linked through the new events in a single write. With
    /// no overlap at all, a fresh fragment is created, gapped on both
    /// sides.
    pub fn write_context(
        &self,
        response: &serde_json::Value,
        txn: &StoreTxn<'_>,
    ) -> Result<GapFillResult, GapError> {
        let response = ContextResponse::from_json(response)?;
        let event_id = required_event_id(&response.event)?;
        if let Some(existing) = txn.timeline_events().get_by_event_id(&self.room_id, event_id)? {
            return Ok(GapFillResult {
                context_event: Some(EventEntry::new(existing)),
                ..GapFillResult::default()
            });
        }

        let detector = OverlapDetector::new(&self.room_id);
        let overlap_up = detector.scan(
            None,
            None,
            Direction::Backward,
            &response.events_before,
            txn,
        )?;
        let overlap_down = detector.scan(
            None,
            None,
            Direction::Forward,
            &response.events_after,
            txn,
        )?;

        // prefer extending the fragment above the context point; fall back
        // to the one below; with neither, open a fresh fragment and treat
        // it as the fragment above
        let mut created_fragment_id = None;
        let (main, other, end_token) = if overlap_up.neighbour_fragment_entry.is_some() {
            (overlap_up, overlap_down, response.end.clone())
        } else if overlap_down.neighbour_fragment_entry.is_some() {
            (overlap_down, overlap_up, response.start.clone())
        } else {
            let mut fragment = self.create_new_fragment(txn)?;
            fragment.previous_token = Some(response.start.clone());
            fragment.next_token = Some(response.end.clone());
            created_fragment_id = Some(fragment.id);
            let main = OverlapResult {
                non_overlapping_events: overlap_up.non_overlapping_events,
                neighbour_fragment_entry: Some(FragmentBoundaryEntry::end(fragment)),
            };
            (main, overlap_down, response.end.clone())
        };

        let mut result =
            self.link_overlapping(main, other, &response.event, end_token, &response.state, txn)?;

        if let Some(created_id) = created_fragment_id {
            if !result.fragments.iter().any(|f| f.id == created_id) {
                let fragment = txn
                    .timeline_fragments()
                    .get(&self.room_id, created_id)?
                    .ok_or(GapError::UnknownFragment(created_id))?;
                result.fragments.push(fragment);
            }
        }
        Ok(result)
    }

    /// Write the composed event run of a context response and link the
    /// fragments on either side of it.
    ///
    /// `main` is the side whose fragment is being extended; its events were
    /// collected walking *away* from the context point, so they are
    /// reversed to line up with the write direction, which is the one
    /// `main`'s neighbour boundary faces.
    fn link_overlapping(
        &self,
        main: OverlapResult,
        other: OverlapResult,
        event: &Event,
        end_token: String,
        chunk_state: &[Event],
        txn: &StoreTxn<'_>,
    ) -> Result<GapFillResult, GapError> {
        let neighbour_entry = main.neighbour_fragment_entry.ok_or_else(|| {
            GapError::InvariantViolation("context write without a main fragment".to_string())
        })?;
        let mut other_neighbour = other.neighbour_fragment_entry;
        if let Some(other_entry) = &other_neighbour {
            if other_entry.fragment_id() == neighbour_entry.fragment_id() {
                // both sides of the context point ran into the same
                // fragment; accepting the pair would self-link it
                wlog!(
                    Warn,
                    "context overlapped fragment {} on both sides in {}, dropping one link",
                    other_entry.fragment_id(),
                    crate::logging::room_id(&self.room_id)
                );
                other_neighbour = None;
            }
        }

        let direction = neighbour_entry.direction();
        let mut all_events: Vec<Event> =
            main.non_overlapping_events.into_iter().rev().collect();
        all_events.push(event.clone());
        all_events.extend(other.non_overlapping_events);

        let detector = OverlapDetector::new(&self.room_id);
        let last_key = self.fragment_edge_event_key(&detector, &neighbour_entry, txn)?;

        let inserter = EventInserter::new(&self.room_id, &self.relation_writer);
        let stored = inserter.store_events(&all_events, last_key, direction, chunk_state, txn)?;

        let event_id = required_event_id(event)?;
        let context_event = stored
            .entries
            .iter()
            .find(|entry| entry.event_id() == event_id)
            .cloned()
            .ok_or_else(|| {
                GapError::InvariantViolation(format!(
                    "context event {event_id} was not among the stored entries"
                ))
            })?;

        let mut entries: Vec<TimelineEntry> =
            stored.entries.into_iter().map(TimelineEntry::Event).collect();
        let fragments = FragmentLinker::new(&self.room_id).update_fragments(
            neighbour_entry,
            other_neighbour,
            Some(end_token),
            &mut entries,
            txn,
        )?;

        Ok(GapFillResult {
            entries,
            updated_entries: stored.updated_entries,
            fragments,
            context_event: Some(context_event),
        })
    }

    /// Insert a fresh, unlinked fragment with the next monotonic ID.
    ///
    /// Monotonicity per room is what lets fragment IDs double as creation
    /// order; it must never be violated.
    fn create_new_fragment(&self, txn: &StoreTxn<'_>) -> Result<Fragment, GapError> {
        let max_id = txn.timeline_fragments().get_max_fragment_id(&self.room_id)?;
        let fragment = Fragment::new(max_id.map_or(0, |max| max + 1), self.room_id.clone());
        txn.timeline_fragments().add(&fragment)?;
        Ok(fragment)
    }

    /// The key of the event at `fragment_entry`'s edge, or the fragment's
    /// neutral key if it holds no events yet.
    fn fragment_edge_event_key(
        &self,
        detector: &OverlapDetector,
        fragment_entry: &FragmentBoundaryEntry,
        txn: &StoreTxn<'_>,
    ) -> Result<EventKey, GapError> {
        let edge_event = detector.fragment_edge_event(
            fragment_entry.fragment_id(),
            fragment_entry.direction(),
            txn,
        )?;
        Ok(edge_event
            .map(|row| row.key)
            .unwrap_or_else(|| EventKey::default_fragment_key(fragment_entry.fragment_id())))
    }
}
