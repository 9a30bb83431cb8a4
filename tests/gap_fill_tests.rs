//! End-to-end gap filling against a simulated homeserver.
//!
//! Each test drives a client session the way the sync loop would: sync
//! responses go through the `SyncWriter`, `/messages` pages through the
//! `GapWriter`, every write in its own committed transaction, and the
//! fragment ID comparer is fed the changed fragments only after commit.

use serde_json::json;

use weft::events::SyncTimeline;
use weft::relations::RelationWriter;
use weft::simulation::{check_fragment_invariants, MockTimeline};
use weft::storage::Storage;
use weft::timeline::{
    Direction, EventKey, Fragment, FragmentBoundaryEntry, FragmentIdComparer, GapError,
    GapFillResult, GapWriter, SyncWriter,
};

const ROOM: &str = "!room:hs";

// ---------------------------------------------------------------------------
// Helpers: a client session against the mock server
// ---------------------------------------------------------------------------

struct Session {
    server: MockTimeline,
    storage: Storage,
    sync_writer: SyncWriter,
    gap_writer: GapWriter,
    comparer: FragmentIdComparer,
}

impl Session {
    fn new() -> Self {
        Self {
            server: MockTimeline::new(ROOM),
            storage: Storage::open_in_memory().unwrap(),
            sync_writer: SyncWriter::new(ROOM, RelationWriter::new(ROOM)),
            gap_writer: GapWriter::new(ROOM, RelationWriter::new(ROOM)),
            comparer: FragmentIdComparer::new(),
        }
    }

    /// Pull one sync from the server and write it.
    fn sync(&mut self, limit: usize) -> weft::timeline::SyncWriteResult {
        let timeline = SyncTimeline::from_json(&self.server.sync(limit)).unwrap();
        let txn = self.storage.begin().unwrap();
        let result = self.sync_writer.write_sync(&timeline, &txn).unwrap();
        txn.commit().unwrap();
        self.comparer.add_fragments(result.fragments.iter());
        result
    }

    /// Fill the backward gap of `fragment_id` with one `/messages` page.
    fn backfill(&mut self, fragment_id: i64, limit: usize) -> GapFillResult {
        let txn = self.storage.begin().unwrap();
        let fragment = txn
            .timeline_fragments()
            .get(ROOM, fragment_id)
            .unwrap()
            .unwrap();
        let entry = FragmentBoundaryEntry::start(fragment);
        let token = entry
            .token()
            .expect("fragment has no previous gap")
            .to_string();
        let response = self.server.messages(&token, Direction::Backward, limit);
        let result = self
            .gap_writer
            .write_fragment_fill(&entry, &response, &txn)
            .unwrap();
        txn.commit().unwrap();
        self.comparer.add_fragments(result.fragments.iter());
        result
    }

    fn fragment(&mut self, id: i64) -> Fragment {
        let txn = self.storage.begin().unwrap();
        txn.timeline_fragments().get(ROOM, id).unwrap().unwrap()
    }

    /// Event IDs stored in one fragment, in key order.
    fn fragment_event_ids(&mut self, id: i64) -> Vec<String> {
        let txn = self.storage.begin().unwrap();
        let rows = txn
            .timeline_events()
            .events_after(ROOM, EventKey::new(id, i64::MIN), u32::MAX)
            .unwrap();
        rows.into_iter().map(|row| row.event_id).collect()
    }

    fn assert_invariants(&mut self) {
        let txn = self.storage.begin().unwrap();
        check_fragment_invariants(&txn, ROOM).unwrap();
    }
}

fn event_ids(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(MockTimeline::event_id_at).collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn backfill_extends_the_live_fragment() {
    let mut session = Session::new();
    session.server.append(30);
    session.sync(10);

    assert_eq!(session.fragment_event_ids(0), event_ids(20..=29));
    assert_eq!(session.fragment(0).previous_token.as_deref(), Some("t20"));

    session.backfill(0, 10);
    assert_eq!(session.fragment_event_ids(0), event_ids(10..=29));
    assert_eq!(session.fragment(0).previous_token.as_deref(), Some("t10"));
    session.assert_invariants();
}

#[test]
fn overlapping_backfill_links_fragments_deeply() {
    let mut session = Session::new();
    session.server.append(10);
    session.sync(10);
    session.server.append(15);
    session.sync(10);

    // the limited sync shallow-linked the two fragments
    assert_eq!(session.fragment(0).next_id, Some(1));
    assert_eq!(session.fragment(1).previous_id, Some(0));
    assert_eq!(session.fragment(1).previous_token.as_deref(), Some("t15"));
    assert_eq!(session.fragment_event_ids(1), event_ids(15..=24));

    // one page spans the gap and overlaps fragment 0
    let result = session.backfill(1, 10);

    assert_eq!(session.fragment_event_ids(0), event_ids(0..=9));
    assert_eq!(session.fragment_event_ids(1), event_ids(10..=24));
    let f0 = session.fragment(0);
    let f1 = session.fragment(1);
    assert_eq!(f0.next_id, Some(1));
    assert_eq!(f1.previous_id, Some(0));
    assert_eq!(f0.next_token, None);
    assert_eq!(f1.previous_token, None);
    session.assert_invariants();

    // the deep link made the fragments comparable
    assert_eq!(session.comparer.compare(0, 1), Ok(std::cmp::Ordering::Less));

    // entries: both touched boundaries first, then the new events
    let boundary_ids: Vec<i64> = result
        .entries
        .iter()
        .filter_map(|e| e.as_boundary().map(|b| b.fragment_id()))
        .collect();
    assert_eq!(boundary_ids, vec![0, 1]);
    let stored_ids: Vec<&str> = result
        .entries
        .iter()
        .filter_map(|e| e.as_event().map(|entry| entry.event_id()))
        .collect();
    assert_eq!(stored_ids, event_ids(10..=14));
}

#[test]
fn backfill_without_overlap_keeps_the_shallow_link_gapped() {
    let mut session = Session::new();
    session.server.append(10);
    session.sync(10);
    session.server.append(20);
    session.sync(10);

    assert_eq!(session.fragment_event_ids(1), event_ids(20..=29));

    // this page stops short of fragment 0
    session.backfill(1, 10);

    let f0 = session.fragment(0);
    let f1 = session.fragment(1);
    assert_eq!(f0.next_id, Some(1));
    assert_eq!(f1.previous_id, Some(0));
    assert_eq!(f1.previous_token.as_deref(), Some("t10"));
    assert_eq!(session.fragment_event_ids(1), event_ids(10..=29));
    session.assert_invariants();

    // the next page is fully overlapping and resolves the gap
    session.backfill(1, 10);
    let f1 = session.fragment(1);
    assert_eq!(f1.previous_id, Some(0));
    assert_eq!(f1.previous_token, None);
    assert_eq!(session.fragment(0).next_token, None);
    assert_eq!(session.fragment_event_ids(1), event_ids(10..=29));
    session.assert_invariants();
}

#[test]
fn backfill_returning_own_events_never_self_links() {
    let mut session = Session::new();
    session.server.append(10);
    session.sync(10);

    // sabotage: point the gap token at the live end, so backfill returns
    // the fragment's own events
    {
        let txn = session.storage.begin().unwrap();
        let mut fragment = txn.timeline_fragments().get(ROOM, 0).unwrap().unwrap();
        fragment.previous_token = Some(session.server.live_token());
        txn.timeline_fragments().update(&fragment).unwrap();
        txn.commit().unwrap();
    }

    let result = session.backfill(0, 10);

    let fragment = session.fragment(0);
    assert_ne!(fragment.previous_id, Some(0));
    assert_ne!(fragment.next_id, Some(0));
    assert_eq!(fragment.previous_id, None);
    assert_eq!(fragment.next_id, None);
    // fully-overlapping page with no neighbour: the token is cleared so
    // the same page is not requested forever
    assert_eq!(fragment.previous_token, None);
    assert!(result.entries.iter().all(|e| e.as_event().is_none()));
    assert_eq!(session.fragment_event_ids(0), event_ids(0..=9));
    session.assert_invariants();
}

#[test]
fn backfill_across_server_side_insertion_still_links() {
    let mut session = Session::new();
    session.server.append(10);
    session.sync(10);
    session.server.append(10);
    session.sync(5);

    assert_eq!(session.fragment_event_ids(1), event_ids(15..=19));

    // the server revises history: five fresh events land between e9 and
    // e10; the gap token stays anchored to the event it precedes, so the
    // page fetched from it walks through the inserted events too
    session.server.insert_at(10, 5);

    // one page spanning the whole revised gap, down into fragment 0
    session.backfill(1, 15);

    assert_eq!(session.fragment_event_ids(0), event_ids(0..=9));
    // the fragment holds the interleaved new events followed by every old
    // one, in exactly the server chunk's order; nothing is dropped
    let mut expected = event_ids(20..=24);
    expected.extend(event_ids(10..=19));
    assert_eq!(session.fragment_event_ids(1), expected);

    let f0 = session.fragment(0);
    let f1 = session.fragment(1);
    assert_eq!(f0.next_id, Some(1));
    assert_eq!(f1.previous_id, Some(0));
    assert_eq!(f0.next_token, None);
    assert_eq!(f1.previous_token, None);
    session.assert_invariants();
}

// ---------------------------------------------------------------------------
// Edge behaviour and failure modes
// ---------------------------------------------------------------------------

#[test]
fn empty_chunk_marks_the_edge_of_history() {
    let mut session = Session::new();
    session.server.append(5);
    session.sync(10);
    assert_eq!(session.fragment(0).previous_token.as_deref(), Some("t0"));

    // nothing before t0: the server answers with an empty chunk
    let result = session.backfill(0, 10);
    let fragment = session.fragment(0);
    assert!(fragment.edge_reached);
    assert_eq!(fragment.previous_token, None);
    assert_eq!(result.entries.len(), 1);
    assert!(result.entries[0].as_boundary().is_some());
    assert!(result.fragments.is_empty());
    session.assert_invariants();
}

#[test]
fn replayed_response_is_rejected_as_stale() {
    let mut session = Session::new();
    session.server.append(30);
    session.sync(10);

    let response = session.server.messages("t20", Direction::Backward, 10);

    // first write succeeds and moves the fragment's token to t10
    {
        let txn = session.storage.begin().unwrap();
        let fragment = txn.timeline_fragments().get(ROOM, 0).unwrap().unwrap();
        let entry = FragmentBoundaryEntry::start(fragment);
        session
            .gap_writer
            .write_fragment_fill(&entry, &response, &txn)
            .unwrap();
        txn.commit().unwrap();
    }

    // replaying the same response must fail, leaving storage untouched
    let txn = session.storage.begin().unwrap();
    let fragment = txn.timeline_fragments().get(ROOM, 0).unwrap().unwrap();
    let entry = FragmentBoundaryEntry::start(fragment);
    let err = session
        .gap_writer
        .write_fragment_fill(&entry, &response, &txn)
        .unwrap_err();
    assert!(matches!(err, GapError::StaleToken { .. }));
    drop(txn);

    assert_eq!(session.fragment_event_ids(0), event_ids(10..=29));
    assert_eq!(session.fragment(0).previous_token.as_deref(), Some("t10"));
    session.assert_invariants();
}

#[test]
fn malformed_response_is_rejected_before_any_write() {
    let mut session = Session::new();
    session.server.append(10);
    session.sync(10);

    let txn = session.storage.begin().unwrap();
    let fragment = txn.timeline_fragments().get(ROOM, 0).unwrap().unwrap();
    let entry = FragmentBoundaryEntry::start(fragment);
    let err = session
        .gap_writer
        .write_fragment_fill(&entry, &json!({"chunk": "nope", "start": "t0"}), &txn)
        .unwrap_err();
    assert!(matches!(err, GapError::MalformedResponse(_)));
    drop(txn);

    assert_eq!(session.fragment_event_ids(0), event_ids(0..=9));
}

#[test]
fn unknown_fragment_is_rejected() {
    let mut session = Session::new();
    session.server.append(10);
    session.sync(10);

    let response = session.server.messages("t0", Direction::Backward, 10);
    let txn = session.storage.begin().unwrap();
    let mut ghost = Fragment::new(99, ROOM);
    ghost.previous_token = Some("t0".to_string());
    let entry = FragmentBoundaryEntry::start(ghost);
    let err = session
        .gap_writer
        .write_fragment_fill(&entry, &response, &txn)
        .unwrap_err();
    assert!(matches!(err, GapError::UnknownFragment(99)));
}

#[test]
fn reaction_arriving_before_its_target_is_folded_in_on_backfill() {
    let mut session = Session::new();
    session.server.append(5);
    session.server.append_reaction(2, "👍", "@bob:hs");
    session.server.append(4);
    session.sync(4);

    assert_eq!(session.fragment_event_ids(0), event_ids(6..=9));

    // the backfilled page carries both the reaction (e5) and, further
    // back, its target (e2)
    session.backfill(0, 10);
    let txn = session.storage.begin().unwrap();
    let target = txn
        .timeline_events()
        .get_by_event_id(ROOM, "$e2")
        .unwrap()
        .unwrap();
    assert_eq!(target.annotations.unwrap()["👍"], 1);
    drop(txn);
    session.assert_invariants();
}

#[test]
fn reaction_synced_after_its_target_updates_the_stored_entry() {
    let mut session = Session::new();
    session.server.append(5);
    session.sync(10);

    session.server.append_reaction(2, "👍", "@bob:hs");
    let result = session.sync(10);

    assert_eq!(result.updated_entries.len(), 1);
    assert_eq!(result.updated_entries[0].event_id(), "$e2");
    let txn = session.storage.begin().unwrap();
    let target = txn
        .timeline_events()
        .get_by_event_id(ROOM, "$e2")
        .unwrap()
        .unwrap();
    assert_eq!(target.annotations.unwrap()["👍"], 1);
}

#[test]
fn display_names_come_from_the_chunk_when_it_has_member_events() {
    let mut session = Session::new();
    session.server.append_member("@alice:hs", "Alice");
    session.server.append(6);
    session.sync(3);
    session.backfill(0, 10);

    let txn = session.storage.begin().unwrap();
    // senders alternate by position, so $e2 is one of @alice's messages
    let row = txn
        .timeline_events()
        .get_by_event_id(ROOM, "$e2")
        .unwrap()
        .unwrap();
    assert_eq!(row.display_name.as_deref(), Some("Alice"));
}
