//! Writing sync responses at the live edge of the timeline.

use crate::events::{Event, MemberSnapshot, SyncTimeline, MEMBER_EVENT_TYPE};
use crate::relations::RelationWriter;
use crate::storage::{RoomMemberRow, StoreTxn};
use crate::timeline::entries::{EventEntry, TimelineEntry};
use crate::timeline::event_key::EventKey;
use crate::timeline::fragment::{Fragment, FragmentBoundaryEntry};
use crate::timeline::inserter::EventInserter;
use crate::timeline::{required_event_id, Direction, GapError};

/// The outcome of writing one sync timeline.
#[derive(Debug, Default)]
pub struct SyncWriteResult {
    /// New timeline entries in chronological order. Starts with a boundary
    /// entry when the sync opened a new live fragment.
    pub entries: Vec<TimelineEntry>,
    /// Previously stored events whose relation bookkeeping changed.
    pub updated_entries: Vec<EventEntry>,
    /// Fragments to hand to the fragment ID comparer after commit.
    pub fragments: Vec<Fragment>,
}

/// Appends live events for one room.
///
/// The first sync creates the live fragment. A `limited` sync abandons the
/// current live position and opens a fresh fragment: the sync `prev_batch`
/// becomes its `previous_token`, and it is *shallow-linked* to the old
/// live fragment (both IDs are set, the token stays). The two fragments'
/// order is known, but the events between them are not stored yet; the
/// [`GapWriter`](crate::timeline::gap_writer::GapWriter) later resolves
/// the gap and clears the token.
pub struct SyncWriter {
    room_id: String,
    relation_writer: RelationWriter,
    last_live_key: Option<EventKey>,
}

impl SyncWriter {
    pub fn new(room_id: impl Into<String>, relation_writer: RelationWriter) -> Self {
        Self {
            room_id: room_id.into(),
            relation_writer,
            last_live_key: None,
        }
    }

    /// Write one room's sync timeline section.
    pub fn write_sync(
        &mut self,
        timeline: &SyncTimeline,
        txn: &StoreTxn<'_>,
    ) -> Result<SyncWriteResult, GapError> {
        let mut result = SyncWriteResult::default();

        let live_key = match self.last_live_key {
            Some(key) => Some(key),
            None => self.find_live_key(txn)?,
        };
        let base_key = match live_key {
            Some(key) if !timeline.limited => key,
            old_live => {
                let mut fragment = self.create_live_fragment(timeline.prev_batch.clone(), txn)?;
                if let Some(old_key) = old_live {
                    // shallow link: order is certain, the gap is not filled
                    let old_id = old_key.fragment_id;
                    let mut old_fragment = txn
                        .timeline_fragments()
                        .get(&self.room_id, old_id)?
                        .ok_or(GapError::UnknownFragment(old_id))?;
                    old_fragment.next_id = Some(fragment.id);
                    fragment.previous_id = Some(old_id);
                    txn.timeline_fragments().update(&old_fragment)?;
                    txn.timeline_fragments().update(&fragment)?;
                    result.fragments.push(old_fragment);
                }
                let key = EventKey::default_fragment_key(fragment.id);
                result.fragments.push(fragment.clone());
                result
                    .entries
                    .push(TimelineEntry::Boundary(FragmentBoundaryEntry::start(
                        fragment,
                    )));
                key
            }
        };

        self.write_member_state(&timeline.events, txn)?;

        // remote echoes of our own sends retire their pending entries
        let mut fresh_events = Vec::new();
        for event in &timeline.events {
            let event_id = required_event_id(event)?;
            txn.pending_events()
                .remove_by_event_id(&self.room_id, event_id)?;
            if txn
                .timeline_events()
                .get_by_event_id(&self.room_id, event_id)?
                .is_none()
            {
                fresh_events.push(event.clone());
            }
        }

        let inserter = EventInserter::new(&self.room_id, &self.relation_writer);
        let stored = inserter.store_events(&fresh_events, base_key, Direction::Forward, &[], txn)?;

        self.last_live_key = Some(
            stored
                .entries
                .last()
                .map(|entry| entry.key())
                .unwrap_or(base_key),
        );
        result
            .entries
            .extend(stored.entries.into_iter().map(TimelineEntry::Event));
        result.updated_entries = stored.updated_entries;
        Ok(result)
    }

    /// The key of the newest stored live event, if any.
    ///
    /// The live fragment is the newest fragment whose forward side is
    /// neither linked nor gapped; fragments made by context writes always
    /// have a resolved forward side, so they never qualify.
    fn find_live_key(&self, txn: &StoreTxn<'_>) -> Result<Option<EventKey>, GapError> {
        let fragments = txn.timeline_fragments().all(&self.room_id)?;
        let live = fragments
            .into_iter()
            .filter(|f| f.next_id.is_none() && f.next_token.is_none())
            .max_by_key(|f| f.id);
        let Some(live) = live else {
            return Ok(None);
        };
        let last = txn
            .timeline_events()
            .last_events(&self.room_id, live.id, 1)?;
        Ok(Some(
            last.first()
                .map(|row| row.key)
                .unwrap_or_else(|| EventKey::default_fragment_key(live.id)),
        ))
    }

    fn create_live_fragment(
        &self,
        previous_token: Option<String>,
        txn: &StoreTxn<'_>,
    ) -> Result<Fragment, GapError> {
        let max_id = txn.timeline_fragments().get_max_fragment_id(&self.room_id)?;
        let mut fragment = Fragment::new(max_id.map_or(0, |max| max + 1), self.room_id.clone());
        fragment.previous_token = previous_token;
        txn.timeline_fragments().add(&fragment)?;
        Ok(fragment)
    }

    /// Fold member events from the sync chunk into the member store, so
    /// later gap fills can resolve sender profiles from it.
    fn write_member_state(&self, events: &[Event], txn: &StoreTxn<'_>) -> Result<(), GapError> {
        for event in events {
            if event.event_type() != Some(MEMBER_EVENT_TYPE) {
                continue;
            }
            let (Some(user_id), Some(content)) = (event.state_key(), event.content()) else {
                continue;
            };
            let membership = content
                .get("membership")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("join");
            let snapshot = MemberSnapshot::from_member_content(content);
            txn.room_members().set(&RoomMemberRow {
                room_id: self.room_id.clone(),
                user_id: user_id.to_string(),
                membership: membership.to_string(),
                display_name: snapshot.display_name,
                avatar_url: snapshot.avatar_url,
            })?;
        }
        Ok(())
    }
}
