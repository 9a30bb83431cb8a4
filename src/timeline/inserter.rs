//! Storing chunk events at successive timeline keys.

use crate::events::{Event, MemberSnapshot};
use crate::relations::RelationWriter;
use crate::storage::{StoreTxn, TimelineEventRow};
use crate::timeline::direction::Direction;
use crate::timeline::entries::{directional_append, EventEntry};
use crate::timeline::event_key::EventKey;
use crate::timeline::{required_event_id, GapError};

/// What a store pass produced.
#[derive(Debug, Default)]
pub struct StoredEvents {
    /// The freshly stored events, in chronological order.
    pub entries: Vec<EventEntry>,
    /// Previously stored events whose relation bookkeeping changed.
    pub updated_entries: Vec<EventEntry>,
}

/// Writes chunk events into `timeline_events` for one room.
pub struct EventInserter<'a> {
    room_id: &'a str,
    relation_writer: &'a RelationWriter,
}

impl<'a> EventInserter<'a> {
    pub fn new(room_id: &'a str, relation_writer: &'a RelationWriter) -> Self {
        Self {
            room_id,
            relation_writer,
        }
    }

    /// Store `events` at successive keys following `start_key` in
    /// `direction`.
    ///
    /// Each event gets the sender's display-name/avatar snapshot if one can
    /// be resolved, and its relation state is settled through the relation
    /// writer before insert. The returned entries are chronological
    /// regardless of direction.
    pub fn store_events(
        &self,
        events: &[Event],
        start_key: EventKey,
        direction: Direction,
        chunk_state: &[Event],
        txn: &StoreTxn<'_>,
    ) -> Result<StoredEvents, GapError> {
        let mut stored = StoredEvents::default();
        let mut key = start_key;
        for (index, event) in events.iter().enumerate() {
            key = key.next_key_for_direction(direction);
            let event_id = required_event_id(event)?.to_string();
            let member = self.find_member(events, index, direction, chunk_state, txn)?;
            let mut row = TimelineEventRow {
                room_id: self.room_id.to_string(),
                key,
                event_id,
                event: event.clone(),
                display_name: member.as_ref().and_then(|m| m.display_name.clone()),
                avatar_url: member.as_ref().and_then(|m| m.avatar_url.clone()),
                annotations: None,
            };
            let updated_targets = self
                .relation_writer
                .write_gap_relation(&mut row, direction, txn)?;
            stored
                .updated_entries
                .extend(updated_targets.into_iter().map(EventEntry::new));
            txn.timeline_events().insert(&row)?;
            directional_append(&mut stored.entries, EventEntry::new(row), direction);
        }
        Ok(stored)
    }

    /// Resolve the membership applying to `events[index].sender`.
    ///
    /// The server's `state` section is ambiguous about whether it describes
    /// the state before or after the chunk, so the chunk itself is searched
    /// first, in both chronological directions, before `state` is trusted:
    ///
    /// 1. An *older* member event within the chunk: its `content` is the
    ///    membership at the time our event was sent.
    /// 2. A *newer* member event within the chunk: it replaced the
    ///    membership our event was sent under, so its `prev_content`
    ///    applies.
    /// 3. A member event in `chunk_state`.
    /// 4. The stored member row for the sender.
    fn find_member(
        &self,
        events: &[Event],
        index: usize,
        direction: Direction,
        chunk_state: &[Event],
        txn: &StoreTxn<'_>,
    ) -> Result<Option<MemberSnapshot>, GapError> {
        let event = &events[index];
        let Some(sender) = event.sender() else {
            return Ok(None);
        };

        // in a backward chunk, chronologically older events sit at higher
        // indices; in a forward chunk, at lower ones
        let toward_older: isize = if direction.is_backward() { 1 } else { -1 };
        let mut i = index as isize + toward_older;
        while i >= 0 && (i as usize) < events.len() {
            let candidate = &events[i as usize];
            if candidate.is_member_event_for(sender) {
                return Ok(candidate.content().map(MemberSnapshot::from_member_content));
            }
            i += toward_older;
        }

        let mut i = index as isize - toward_older;
        while i >= 0 && (i as usize) < events.len() {
            let candidate = &events[i as usize];
            if candidate.is_member_event_for(sender) {
                return Ok(candidate
                    .prev_content()
                    .map(MemberSnapshot::from_member_content));
            }
            i -= toward_older;
        }

        if let Some(state_member) = chunk_state.iter().find(|e| e.is_member_event_for(sender)) {
            return Ok(state_member.content().map(MemberSnapshot::from_member_content));
        }

        if let Some(member_row) = txn.room_members().get(self.room_id, sender)? {
            return Ok(Some(MemberSnapshot {
                display_name: member_row.display_name,
                avatar_url: member_row.avatar_url,
            }));
        }

        Ok(None)
    }
}
