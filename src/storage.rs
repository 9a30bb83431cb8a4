//! SQLite storage layer for the timeline store.
//!
//! Provides the on-disk tables backing a room timeline: events keyed by
//! `(fragment_id, event_index)`, fragment records, relation rows, member
//! state, and locally-pending events. All writes the timeline engine makes
//! go through a caller-owned [`StoreTxn`]; the engine never commits, so a
//! whole gap fill is all-or-nothing.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::events::Event;
use crate::timeline::event_key::EventKey;
use crate::timeline::fragment::{Fragment, FragmentId};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    NotFound(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Serde(e) => write!(f, "serialization error: {e}"),
            StorageError::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Map of annotation key (the emoji) to aggregate count, kept on the
/// annotated event's row. Owned by the relation writer.
pub type AnnotationMap = BTreeMap<String, u64>;

/// Timeline event row stored in the database.
///
/// Immutable after insert except for the annotation map, which the
/// relation writer updates as annotations referencing this event arrive.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEventRow {
    pub room_id: String,
    pub key: EventKey,
    pub event_id: String,
    pub event: Event,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub annotations: Option<AnnotationMap>,
}

/// Relation row: `source` declares a relation of `rel_type` on `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRow {
    pub room_id: String,
    pub target_event_id: String,
    pub source_event_id: String,
    pub rel_type: String,
    /// Annotation key (the emoji) for `m.annotation` rows.
    pub annotation_key: Option<String>,
}

/// Member state row for one user in one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMemberRow {
    pub room_id: String,
    pub user_id: String,
    pub membership: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// A locally-sent event awaiting its remote echo.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEventRow {
    pub room_id: String,
    pub txn_id: String,
    /// Set once the server acknowledged the send.
    pub event_id: Option<String>,
    pub event: Event,
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Main storage handle wrapping a SQLite connection.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database, for tests and tooling.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS timeline_fragments (
                room_id         TEXT NOT NULL,
                id              INTEGER NOT NULL,
                previous_id     INTEGER,
                next_id         INTEGER,
                previous_token  TEXT,
                next_token      TEXT,
                edge_reached    INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (room_id, id)
            );

            CREATE TABLE IF NOT EXISTS timeline_events (
                room_id         TEXT NOT NULL,
                fragment_id     INTEGER NOT NULL,
                event_index     INTEGER NOT NULL,
                event_id        TEXT NOT NULL,
                event           TEXT NOT NULL,
                display_name    TEXT,
                avatar_url      TEXT,
                annotations     TEXT,
                PRIMARY KEY (room_id, fragment_id, event_index)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_timeline_events_event_id
                ON timeline_events(room_id, event_id);

            CREATE TABLE IF NOT EXISTS timeline_relations (
                room_id         TEXT NOT NULL,
                target_event_id TEXT NOT NULL,
                source_event_id TEXT NOT NULL,
                rel_type        TEXT NOT NULL,
                annotation_key  TEXT,
                PRIMARY KEY (room_id, target_event_id, rel_type, source_event_id)
            );

            CREATE TABLE IF NOT EXISTS room_members (
                room_id         TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                membership      TEXT NOT NULL,
                display_name    TEXT,
                avatar_url      TEXT,
                PRIMARY KEY (room_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS pending_events (
                room_id         TEXT NOT NULL,
                txn_id          TEXT NOT NULL,
                event_id        TEXT,
                event           TEXT NOT NULL,
                PRIMARY KEY (room_id, txn_id)
            );

            CREATE INDEX IF NOT EXISTS idx_pending_events_event_id
                ON pending_events(room_id, event_id);
            ",
        )?;
        Ok(())
    }

    /// Begin a read-write transaction covering all object stores.
    ///
    /// The timeline writers take a `&StoreTxn` and never commit; call
    /// [`StoreTxn::commit`] once the whole operation succeeded. Dropping
    /// the transaction rolls everything back.
    pub fn begin(&mut self) -> Result<StoreTxn<'_>, StorageError> {
        Ok(StoreTxn {
            txn: self.conn.transaction()?,
        })
    }
}

/// One read-write transaction over the timeline object stores.
pub struct StoreTxn<'conn> {
    txn: rusqlite::Transaction<'conn>,
}

impl StoreTxn<'_> {
    pub fn commit(self) -> Result<(), StorageError> {
        self.txn.commit()?;
        Ok(())
    }

    pub fn timeline_events(&self) -> TimelineEventStore<'_> {
        TimelineEventStore { txn: &self.txn }
    }

    pub fn timeline_fragments(&self) -> TimelineFragmentStore<'_> {
        TimelineFragmentStore { txn: &self.txn }
    }

    pub fn timeline_relations(&self) -> TimelineRelationStore<'_> {
        TimelineRelationStore { txn: &self.txn }
    }

    pub fn room_members(&self) -> RoomMemberStore<'_> {
        RoomMemberStore { txn: &self.txn }
    }

    pub fn pending_events(&self) -> PendingEventStore<'_> {
        PendingEventStore { txn: &self.txn }
    }
}

// ---------------------------------------------------------------------------
// Timeline events
// ---------------------------------------------------------------------------

const EVENT_COLUMNS: &str =
    "room_id, fragment_id, event_index, event_id, event, display_name, avatar_url, annotations";

fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TimelineEventRow> {
    let event_json: String = row.get(4)?;
    let event: Event = serde_json::from_str(&event_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let annotations_json: Option<String> = row.get(7)?;
    let annotations = match annotations_json {
        None => None,
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?),
    };
    Ok(TimelineEventRow {
        room_id: row.get(0)?,
        key: EventKey::new(row.get(1)?, row.get(2)?),
        event_id: row.get(3)?,
        event,
        display_name: row.get(5)?,
        avatar_url: row.get(6)?,
        annotations,
    })
}

/// View over the `timeline_events` store.
pub struct TimelineEventStore<'a> {
    txn: &'a rusqlite::Transaction<'a>,
}

impl TimelineEventStore<'_> {
    /// Insert a new event row. Fails if the key or the event ID is already
    /// present; the writers deduplicate before inserting.
    pub fn insert(&self, row: &TimelineEventRow) -> Result<(), StorageError> {
        let annotations = row
            .annotations
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.txn.execute(
            "INSERT INTO timeline_events
             (room_id, fragment_id, event_index, event_id, event,
              display_name, avatar_url, annotations)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.room_id,
                row.key.fragment_id,
                row.key.event_index,
                row.event_id,
                serde_json::to_string(&row.event)?,
                row.display_name,
                row.avatar_url,
                annotations,
            ],
        )?;
        Ok(())
    }

    /// Rewrite an existing row (relation-target bookkeeping only).
    pub fn update(&self, row: &TimelineEventRow) -> Result<(), StorageError> {
        let annotations = row
            .annotations
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let affected = self.txn.execute(
            "UPDATE timeline_events
             SET event = ?1, display_name = ?2, avatar_url = ?3, annotations = ?4
             WHERE room_id = ?5 AND fragment_id = ?6 AND event_index = ?7",
            params![
                serde_json::to_string(&row.event)?,
                row.display_name,
                row.avatar_url,
                annotations,
                row.room_id,
                row.key.fragment_id,
                row.key.event_index,
            ],
        )?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!(
                "timeline event at {} in {}",
                row.key, row.room_id
            )));
        }
        Ok(())
    }

    pub fn get_by_event_id(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Option<TimelineEventRow>, StorageError> {
        let mut stmt = self.txn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM timeline_events
             WHERE room_id = ?1 AND event_id = ?2"
        ))?;
        let row = stmt
            .query_row(params![room_id, event_id], map_event_row)
            .optional()?;
        Ok(row)
    }

    /// Of the given event IDs, return the one that occurs first in the
    /// handed-in order and already exists on disk.
    pub fn find_first_occurring_event_id(
        &self,
        room_id: &str,
        event_ids: &[&str],
    ) -> Result<Option<String>, StorageError> {
        if event_ids.is_empty() {
            return Ok(None);
        }
        let placeholders = vec!["?"; event_ids.len()].join(", ");
        let sql = format!(
            "SELECT event_id FROM timeline_events
             WHERE room_id = ?1 AND event_id IN ({placeholders})"
        );
        let mut stmt = self.txn.prepare(&sql)?;
        let mut bind_values: Vec<&dyn rusqlite::types::ToSql> = vec![&room_id];
        for id in event_ids {
            bind_values.push(id);
        }
        let existing: HashSet<String> = stmt
            .query_map(bind_values.as_slice(), |row| row.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;
        Ok(event_ids
            .iter()
            .find(|id| existing.contains(**id))
            .map(|id| id.to_string()))
    }

    /// The `n` events at the start (lowest keys) of a fragment, in
    /// chronological order.
    pub fn first_events(
        &self,
        room_id: &str,
        fragment_id: FragmentId,
        n: u32,
    ) -> Result<Vec<TimelineEventRow>, StorageError> {
        let mut stmt = self.txn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM timeline_events
             WHERE room_id = ?1 AND fragment_id = ?2
             ORDER BY event_index ASC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![room_id, fragment_id, n], map_event_row)?;
        rows.collect::<Result<_, _>>().map_err(StorageError::from)
    }

    /// The `n` events at the end (highest keys) of a fragment, in
    /// chronological order.
    pub fn last_events(
        &self,
        room_id: &str,
        fragment_id: FragmentId,
        n: u32,
    ) -> Result<Vec<TimelineEventRow>, StorageError> {
        let mut stmt = self.txn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM timeline_events
             WHERE room_id = ?1 AND fragment_id = ?2
             ORDER BY event_index DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![room_id, fragment_id, n], map_event_row)?;
        let mut events: Vec<TimelineEventRow> =
            rows.collect::<Result<_, _>>().map_err(StorageError::from)?;
        events.reverse();
        Ok(events)
    }

    /// Number of events stored in one fragment.
    pub fn count(&self, room_id: &str, fragment_id: FragmentId) -> Result<u64, StorageError> {
        let count: i64 = self.txn.query_row(
            "SELECT COUNT(*) FROM timeline_events WHERE room_id = ?1 AND fragment_id = ?2",
            params![room_id, fragment_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Up to `n` events strictly after `key` within the same fragment, in
    /// chronological order.
    pub fn events_after(
        &self,
        room_id: &str,
        key: EventKey,
        n: u32,
    ) -> Result<Vec<TimelineEventRow>, StorageError> {
        let mut stmt = self.txn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM timeline_events
             WHERE room_id = ?1 AND fragment_id = ?2 AND event_index > ?3
             ORDER BY event_index ASC LIMIT ?4"
        ))?;
        let rows = stmt.query_map(
            params![room_id, key.fragment_id, key.event_index, n],
            map_event_row,
        )?;
        rows.collect::<Result<_, _>>().map_err(StorageError::from)
    }
}

// ---------------------------------------------------------------------------
// Timeline fragments
// ---------------------------------------------------------------------------

const FRAGMENT_COLUMNS: &str =
    "room_id, id, previous_id, next_id, previous_token, next_token, edge_reached";

fn map_fragment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fragment> {
    Ok(Fragment {
        room_id: row.get(0)?,
        id: row.get(1)?,
        previous_id: row.get(2)?,
        next_id: row.get(3)?,
        previous_token: row.get(4)?,
        next_token: row.get(5)?,
        edge_reached: row.get::<_, i32>(6)? != 0,
    })
}

/// View over the `timeline_fragments` store.
pub struct TimelineFragmentStore<'a> {
    txn: &'a rusqlite::Transaction<'a>,
}

impl TimelineFragmentStore<'_> {
    pub fn add(&self, fragment: &Fragment) -> Result<(), StorageError> {
        self.txn.execute(
            "INSERT INTO timeline_fragments
             (room_id, id, previous_id, next_id, previous_token, next_token, edge_reached)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fragment.room_id,
                fragment.id,
                fragment.previous_id,
                fragment.next_id,
                fragment.previous_token,
                fragment.next_token,
                fragment.edge_reached as i32,
            ],
        )?;
        Ok(())
    }

    pub fn update(&self, fragment: &Fragment) -> Result<(), StorageError> {
        let affected = self.txn.execute(
            "UPDATE timeline_fragments
             SET previous_id = ?1, next_id = ?2, previous_token = ?3,
                 next_token = ?4, edge_reached = ?5
             WHERE room_id = ?6 AND id = ?7",
            params![
                fragment.previous_id,
                fragment.next_id,
                fragment.previous_token,
                fragment.next_token,
                fragment.edge_reached as i32,
                fragment.room_id,
                fragment.id,
            ],
        )?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!(
                "fragment {} in {}",
                fragment.id, fragment.room_id
            )));
        }
        Ok(())
    }

    pub fn get(&self, room_id: &str, id: FragmentId) -> Result<Option<Fragment>, StorageError> {
        let mut stmt = self.txn.prepare(&format!(
            "SELECT {FRAGMENT_COLUMNS} FROM timeline_fragments
             WHERE room_id = ?1 AND id = ?2"
        ))?;
        let row = stmt
            .query_row(params![room_id, id], map_fragment_row)
            .optional()?;
        Ok(row)
    }

    pub fn get_max_fragment_id(&self, room_id: &str) -> Result<Option<FragmentId>, StorageError> {
        let max: Option<FragmentId> = self.txn.query_row(
            "SELECT MAX(id) FROM timeline_fragments WHERE room_id = ?1",
            params![room_id],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Every room that has at least one fragment.
    pub fn rooms(&self) -> Result<Vec<String>, StorageError> {
        let mut stmt = self
            .txn
            .prepare("SELECT DISTINCT room_id FROM timeline_fragments ORDER BY room_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>().map_err(StorageError::from)
    }

    /// All fragments of a room, by ascending ID.
    pub fn all(&self, room_id: &str) -> Result<Vec<Fragment>, StorageError> {
        let mut stmt = self.txn.prepare(&format!(
            "SELECT {FRAGMENT_COLUMNS} FROM timeline_fragments
             WHERE room_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![room_id], map_fragment_row)?;
        rows.collect::<Result<_, _>>().map_err(StorageError::from)
    }
}

// ---------------------------------------------------------------------------
// Timeline relations
// ---------------------------------------------------------------------------

/// View over the `timeline_relations` store.
pub struct TimelineRelationStore<'a> {
    txn: &'a rusqlite::Transaction<'a>,
}

impl TimelineRelationStore<'_> {
    /// Record a relation. Duplicate rows are silently ignored; the primary
    /// key is the deduplication.
    pub fn add(&self, row: &RelationRow) -> Result<(), StorageError> {
        self.txn.execute(
            "INSERT OR IGNORE INTO timeline_relations
             (room_id, target_event_id, source_event_id, rel_type, annotation_key)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.room_id,
                row.target_event_id,
                row.source_event_id,
                row.rel_type,
                row.annotation_key,
            ],
        )?;
        Ok(())
    }

    /// All relations of one type pointing at `target_event_id`.
    pub fn get_for_target(
        &self,
        room_id: &str,
        target_event_id: &str,
        rel_type: &str,
    ) -> Result<Vec<RelationRow>, StorageError> {
        let mut stmt = self.txn.prepare(
            "SELECT room_id, target_event_id, source_event_id, rel_type, annotation_key
             FROM timeline_relations
             WHERE room_id = ?1 AND target_event_id = ?2 AND rel_type = ?3
             ORDER BY source_event_id",
        )?;
        let rows = stmt.query_map(params![room_id, target_event_id, rel_type], |row| {
            Ok(RelationRow {
                room_id: row.get(0)?,
                target_event_id: row.get(1)?,
                source_event_id: row.get(2)?,
                rel_type: row.get(3)?,
                annotation_key: row.get(4)?,
            })
        })?;
        rows.collect::<Result<_, _>>().map_err(StorageError::from)
    }
}

// ---------------------------------------------------------------------------
// Room members
// ---------------------------------------------------------------------------

/// View over the `room_members` store.
pub struct RoomMemberStore<'a> {
    txn: &'a rusqlite::Transaction<'a>,
}

impl RoomMemberStore<'_> {
    pub fn set(&self, row: &RoomMemberRow) -> Result<(), StorageError> {
        self.txn.execute(
            "INSERT OR REPLACE INTO room_members
             (room_id, user_id, membership, display_name, avatar_url)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.room_id,
                row.user_id,
                row.membership,
                row.display_name,
                row.avatar_url,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, room_id: &str, user_id: &str) -> Result<Option<RoomMemberRow>, StorageError> {
        let mut stmt = self.txn.prepare(
            "SELECT room_id, user_id, membership, display_name, avatar_url
             FROM room_members WHERE room_id = ?1 AND user_id = ?2",
        )?;
        let row = stmt
            .query_row(params![room_id, user_id], |row| {
                Ok(RoomMemberRow {
                    room_id: row.get(0)?,
                    user_id: row.get(1)?,
                    membership: row.get(2)?,
                    display_name: row.get(3)?,
                    avatar_url: row.get(4)?,
                })
            })
            .optional()?;
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// Pending events
// ---------------------------------------------------------------------------

/// View over the `pending_events` store.
pub struct PendingEventStore<'a> {
    txn: &'a rusqlite::Transaction<'a>,
}

impl PendingEventStore<'_> {
    pub fn add(&self, row: &PendingEventRow) -> Result<(), StorageError> {
        self.txn.execute(
            "INSERT INTO pending_events (room_id, txn_id, event_id, event)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                row.room_id,
                row.txn_id,
                row.event_id,
                serde_json::to_string(&row.event)?,
            ],
        )?;
        Ok(())
    }

    pub fn list(&self, room_id: &str) -> Result<Vec<PendingEventRow>, StorageError> {
        let mut stmt = self.txn.prepare(
            "SELECT room_id, txn_id, event_id, event
             FROM pending_events WHERE room_id = ?1 ORDER BY txn_id",
        )?;
        let rows = stmt.query_map(params![room_id], |row| {
            let event_json: String = row.get(3)?;
            let event: Event = serde_json::from_str(&event_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Ok(PendingEventRow {
                room_id: row.get(0)?,
                txn_id: row.get(1)?,
                event_id: row.get(2)?,
                event,
            })
        })?;
        rows.collect::<Result<_, _>>().map_err(StorageError::from)
    }

    /// Drop the pending event whose remote echo arrived. Returns whether a
    /// row was removed.
    pub fn remove_by_event_id(&self, room_id: &str, event_id: &str) -> Result<bool, StorageError> {
        let affected = self.txn.execute(
            "DELETE FROM pending_events WHERE room_id = ?1 AND event_id = ?2",
            params![room_id, event_id],
        )?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_storage() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    fn event_row(room_id: &str, key: EventKey, event_id: &str) -> TimelineEventRow {
        TimelineEventRow {
            room_id: room_id.to_string(),
            key,
            event_id: event_id.to_string(),
            event: Event::new(json!({"event_id": event_id, "type": "m.room.message"})),
            display_name: None,
            avatar_url: None,
            annotations: None,
        }
    }

    #[test]
    fn event_insert_and_lookup() {
        let mut storage = test_storage();
        let txn = storage.begin().unwrap();
        let row = event_row("!r", EventKey::new(0, 100), "$e1");
        txn.timeline_events().insert(&row).unwrap();

        let loaded = txn.timeline_events().get_by_event_id("!r", "$e1").unwrap();
        assert_eq!(loaded, Some(row));
        assert!(txn
            .timeline_events()
            .get_by_event_id("!r", "$missing")
            .unwrap()
            .is_none());
    }

    #[test]
    fn duplicate_event_id_is_rejected() {
        let mut storage = test_storage();
        let txn = storage.begin().unwrap();
        txn.timeline_events()
            .insert(&event_row("!r", EventKey::new(0, 100), "$e1"))
            .unwrap();
        let err = txn
            .timeline_events()
            .insert(&event_row("!r", EventKey::new(0, 101), "$e1"))
            .unwrap_err();
        assert!(matches!(err, StorageError::Sqlite(_)));
    }

    #[test]
    fn find_first_occurring_respects_list_order() {
        let mut storage = test_storage();
        let txn = storage.begin().unwrap();
        txn.timeline_events()
            .insert(&event_row("!r", EventKey::new(0, 100), "$e1"))
            .unwrap();
        txn.timeline_events()
            .insert(&event_row("!r", EventKey::new(0, 101), "$e2"))
            .unwrap();

        // $e2 comes first in the handed-in list, so it wins even though
        // $e1 has the lower storage key.
        let found = txn
            .timeline_events()
            .find_first_occurring_event_id("!r", &["$missing", "$e2", "$e1"])
            .unwrap();
        assert_eq!(found.as_deref(), Some("$e2"));

        let none = txn
            .timeline_events()
            .find_first_occurring_event_id("!r", &["$nope"])
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn first_and_last_events_are_chronological() {
        let mut storage = test_storage();
        let txn = storage.begin().unwrap();
        for (index, event_id) in [(100, "$a"), (101, "$b"), (102, "$c")] {
            txn.timeline_events()
                .insert(&event_row("!r", EventKey::new(0, index), event_id))
                .unwrap();
        }
        let first = txn.timeline_events().first_events("!r", 0, 2).unwrap();
        assert_eq!(
            first.iter().map(|r| r.event_id.as_str()).collect::<Vec<_>>(),
            vec!["$a", "$b"]
        );
        let last = txn.timeline_events().last_events("!r", 0, 2).unwrap();
        assert_eq!(
            last.iter().map(|r| r.event_id.as_str()).collect::<Vec<_>>(),
            vec!["$b", "$c"]
        );
        let after = txn
            .timeline_events()
            .events_after("!r", EventKey::new(0, 100), 10)
            .unwrap();
        assert_eq!(
            after.iter().map(|r| r.event_id.as_str()).collect::<Vec<_>>(),
            vec!["$b", "$c"]
        );
    }

    #[test]
    fn fragment_crud_and_max_id() {
        let mut storage = test_storage();
        let txn = storage.begin().unwrap();
        let store = txn.timeline_fragments();
        assert_eq!(store.get_max_fragment_id("!r").unwrap(), None);

        let mut fragment = Fragment::new(0, "!r");
        fragment.previous_token = Some("t1".to_string());
        store.add(&fragment).unwrap();
        store.add(&Fragment::new(1, "!r")).unwrap();
        assert_eq!(store.get_max_fragment_id("!r").unwrap(), Some(1));

        fragment.next_id = Some(1);
        fragment.previous_token = None;
        store.update(&fragment).unwrap();
        let loaded = store.get("!r", 0).unwrap().unwrap();
        assert_eq!(loaded.next_id, Some(1));
        assert_eq!(loaded.previous_token, None);

        assert_eq!(store.all("!r").unwrap().len(), 2);
        let missing = store.update(&Fragment::new(9, "!r"));
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn transaction_rollback_discards_writes() {
        let mut storage = test_storage();
        {
            let txn = storage.begin().unwrap();
            txn.timeline_fragments()
                .add(&Fragment::new(0, "!r"))
                .unwrap();
            // dropped without commit
        }
        let txn = storage.begin().unwrap();
        assert!(txn.timeline_fragments().get("!r", 0).unwrap().is_none());
    }

    #[test]
    fn relation_rows_deduplicate() {
        let mut storage = test_storage();
        let txn = storage.begin().unwrap();
        let row = RelationRow {
            room_id: "!r".to_string(),
            target_event_id: "$t".to_string(),
            source_event_id: "$s".to_string(),
            rel_type: "m.annotation".to_string(),
            annotation_key: Some("👍".to_string()),
        };
        txn.timeline_relations().add(&row).unwrap();
        txn.timeline_relations().add(&row).unwrap();
        let rows = txn
            .timeline_relations()
            .get_for_target("!r", "$t", "m.annotation")
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn pending_event_echo_removal() {
        let mut storage = test_storage();
        let txn = storage.begin().unwrap();
        txn.pending_events()
            .add(&PendingEventRow {
                room_id: "!r".to_string(),
                txn_id: "txn-1".to_string(),
                event_id: Some("$e1".to_string()),
                event: Event::new(json!({"type": "m.room.message"})),
            })
            .unwrap();
        assert_eq!(txn.pending_events().list("!r").unwrap().len(), 1);
        assert!(txn
            .pending_events()
            .remove_by_event_id("!r", "$e1")
            .unwrap());
        assert!(txn.pending_events().list("!r").unwrap().is_empty());
    }
}
