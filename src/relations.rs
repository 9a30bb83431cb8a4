//! Relation bookkeeping for events written by the timeline writers.
//!
//! An event can declare a relation on another event
//! (`content["m.relates_to"]`); annotations (reactions) are the one kind
//! the store aggregates. The writer records every relation as a row and
//! keeps the aggregate annotation map on the *target* event's row, so a
//! timeline view can render reaction counts without scanning relations.
//!
//! Relation rows deduplicate on their primary key; the writers never see a
//! duplicate annotation event anyway because events deduplicate by ID.

use crate::events::ANNOTATION_REL_TYPE;
use crate::storage::{AnnotationMap, RelationRow, StorageError, StoreTxn, TimelineEventRow};
use crate::timeline::direction::Direction;

/// Writes relation rows and annotation aggregates for one room.
pub struct RelationWriter {
    room_id: String,
}

impl RelationWriter {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
        }
    }

    /// Consult and update relation state for an event about to be stored
    /// by a gap fill or sync write.
    ///
    /// Two cases:
    /// - `source` declares a relation: record the relation row; if the
    ///   target event is already stored, refresh its annotation aggregate
    ///   and return the updated target row.
    /// - On a backward fill, `source` may itself be the target of
    ///   relations stored earlier (its reactions arrived before it did):
    ///   fold those rows into `source.annotations` before the caller
    ///   inserts it.
    pub fn write_gap_relation(
        &self,
        source: &mut TimelineEventRow,
        direction: Direction,
        txn: &StoreTxn<'_>,
    ) -> Result<Vec<TimelineEventRow>, StorageError> {
        let mut updated_targets = Vec::new();

        if let Some(relation) = source.event.relation() {
            txn.timeline_relations().add(&RelationRow {
                room_id: self.room_id.clone(),
                target_event_id: relation.event_id.clone(),
                source_event_id: source.event_id.clone(),
                rel_type: relation.rel_type.clone(),
                annotation_key: relation.key.clone(),
            })?;

            if relation.rel_type == ANNOTATION_REL_TYPE {
                if let Some(mut target) = txn
                    .timeline_events()
                    .get_by_event_id(&self.room_id, &relation.event_id)?
                {
                    target.annotations = self.aggregate_annotations(&target.event_id, txn)?;
                    txn.timeline_events().update(&target)?;
                    updated_targets.push(target);
                }
            }
        }

        if direction.is_backward() {
            source.annotations = self.aggregate_annotations(&source.event_id, txn)?;
        }

        Ok(updated_targets)
    }

    /// Aggregate stored annotation rows targeting `event_id` into a
    /// key → count map. `None` when there are no annotations.
    fn aggregate_annotations(
        &self,
        event_id: &str,
        txn: &StoreTxn<'_>,
    ) -> Result<Option<AnnotationMap>, StorageError> {
        let rows = txn
            .timeline_relations()
            .get_for_target(&self.room_id, event_id, ANNOTATION_REL_TYPE)?;
        let mut annotations = AnnotationMap::new();
        for row in rows {
            if let Some(key) = row.annotation_key {
                *annotations.entry(key).or_insert(0) += 1;
            }
        }
        Ok(if annotations.is_empty() {
            None
        } else {
            Some(annotations)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::storage::Storage;
    use crate::timeline::event_key::EventKey;
    use serde_json::json;

    fn message_row(key: EventKey, event_id: &str) -> TimelineEventRow {
        TimelineEventRow {
            room_id: "!r".to_string(),
            key,
            event_id: event_id.to_string(),
            event: Event::new(json!({"event_id": event_id, "type": "m.room.message"})),
            display_name: None,
            avatar_url: None,
            annotations: None,
        }
    }

    fn reaction_row(key: EventKey, event_id: &str, target: &str, emoji: &str) -> TimelineEventRow {
        TimelineEventRow {
            room_id: "!r".to_string(),
            key,
            event_id: event_id.to_string(),
            event: Event::new(json!({
                "event_id": event_id,
                "type": "m.reaction",
                "content": {
                    "m.relates_to": {
                        "rel_type": ANNOTATION_REL_TYPE,
                        "event_id": target,
                        "key": emoji,
                    }
                }
            })),
            display_name: None,
            avatar_url: None,
            annotations: None,
        }
    }

    #[test]
    fn annotation_updates_stored_target() {
        let mut storage = Storage::open_in_memory().unwrap();
        let txn = storage.begin().unwrap();
        let writer = RelationWriter::new("!r");

        let target = message_row(EventKey::new(0, 100), "$t");
        txn.timeline_events().insert(&target).unwrap();

        let mut reaction = reaction_row(EventKey::new(0, 101), "$r1", "$t", "👍");
        let updated = writer
            .write_gap_relation(&mut reaction, Direction::Forward, &txn)
            .unwrap();

        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].annotations.as_ref().unwrap()["👍"], 1);
        let stored = txn
            .timeline_events()
            .get_by_event_id("!r", "$t")
            .unwrap()
            .unwrap();
        assert_eq!(stored.annotations.as_ref().unwrap()["👍"], 1);
    }

    #[test]
    fn backward_fill_folds_existing_relations_into_target() {
        let mut storage = Storage::open_in_memory().unwrap();
        let txn = storage.begin().unwrap();
        let writer = RelationWriter::new("!r");

        // two reactions arrived (via sync) before their target was
        // backfilled; the relation rows exist, the target does not
        for (event_id, emoji) in [("$r1", "👍"), ("$r2", "👍")] {
            let mut reaction = reaction_row(EventKey::new(1, 100), event_id, "$t", emoji);
            writer
                .write_gap_relation(&mut reaction, Direction::Forward, &txn)
                .unwrap();
        }

        let mut target = message_row(EventKey::new(0, 100), "$t");
        let updated = writer
            .write_gap_relation(&mut target, Direction::Backward, &txn)
            .unwrap();
        assert!(updated.is_empty());
        assert_eq!(target.annotations.as_ref().unwrap()["👍"], 2);
    }

    #[test]
    fn unannotated_event_stays_clean() {
        let mut storage = Storage::open_in_memory().unwrap();
        let txn = storage.begin().unwrap();
        let writer = RelationWriter::new("!r");

        let mut row = message_row(EventKey::new(0, 100), "$plain");
        let updated = writer
            .write_gap_relation(&mut row, Direction::Backward, &txn)
            .unwrap();
        assert!(updated.is_empty());
        assert!(row.annotations.is_none());
    }
}
