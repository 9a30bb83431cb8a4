//! Simulated homeserver timeline for tests and tooling.
//!
//! [`MockTimeline`] keeps a full chronological server-side event log and
//! answers `/sync`, `/messages`, and `/context` the way a homeserver would.
//! Responses are raw JSON so consumers go through the same parsing and
//! validation as production input.
//!
//! Tokens are `t{n}`, denoting the boundary *before* the event `$e{n}`.
//! Anchoring tokens to events rather than positions keeps an outstanding
//! token valid when the server later inserts events behind it; a window
//! paginated from such a token spans everything up to its anchor event,
//! insertions included. A backward request from the boundary before the
//! oldest event returns an empty chunk with no `end` token, which is how a
//! server signals the edge of history.

use serde_json::{json, Value};

use crate::storage::StoreTxn;
use crate::timeline::Direction;

/// An appendable server-side room timeline.
pub struct MockTimeline {
    room_id: String,
    events: Vec<Value>,
    counter: usize,
    sync_position: usize,
}

impl MockTimeline {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            events: Vec::new(),
            counter: 0,
            sync_position: 0,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Number of events in the server-side log.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The event ID at position `index`: `$e0`, `$e1`, …
    pub fn event_id_at(index: usize) -> String {
        format!("$e{index}")
    }

    /// Append `count` plain message events, senders alternating between
    /// two users.
    pub fn append(&mut self, count: usize) {
        for _ in 0..count {
            let sender = if self.counter % 2 == 0 {
                "@alice:hs"
            } else {
                "@bob:hs"
            };
            self.append_event(json!({
                "type": "m.room.message",
                "sender": sender,
                "content": {"body": format!("message {}", self.counter)},
            }));
        }
    }

    /// Append a membership state event.
    pub fn append_member(&mut self, user_id: &str, displayname: &str) {
        self.append_event(json!({
            "type": "m.room.member",
            "sender": user_id,
            "state_key": user_id,
            "content": {"membership": "join", "displayname": displayname},
        }));
    }

    /// Append a reaction to the event at `target_index`.
    pub fn append_reaction(&mut self, target_index: usize, key: &str, sender: &str) {
        let target = Self::event_id_at(target_index);
        self.append_event(json!({
            "type": "m.reaction",
            "sender": sender,
            "content": {
                "m.relates_to": {"rel_type": "m.annotation", "event_id": target, "key": key}
            },
        }));
    }

    fn append_event(&mut self, mut event: Value) {
        event["event_id"] = Value::String(Self::event_id_at(self.counter));
        event["room_id"] = Value::String(self.room_id.clone());
        event["origin_server_ts"] = json!(self.counter);
        self.events.push(event);
        self.counter += 1;
    }

    /// Insert `count` fresh message events at `position` in the server-side
    /// log, shifting everything behind them. Servers do revise history like
    /// this; tokens handed out earlier stay anchored to the events they
    /// precede, so a later pagination from one of them walks through the
    /// inserted events too.
    pub fn insert_at(&mut self, position: usize, count: usize) {
        for offset in 0..count {
            let event = json!({
                "event_id": Self::event_id_at(self.counter),
                "room_id": self.room_id.clone(),
                "origin_server_ts": self.counter,
                "type": "m.room.message",
                "sender": "@carol:hs",
                "content": {"body": format!("message {}", self.counter)},
            });
            self.events.insert(position + offset, event);
            self.counter += 1;
        }
        if self.sync_position >= position {
            self.sync_position += count;
        }
    }

    /// The number of an event in the log, extracted from its ID.
    fn event_number(event: &Value) -> usize {
        event["event_id"]
            .as_str()
            .and_then(|id| id.strip_prefix("$e"))
            .and_then(|n| n.parse().ok())
            .expect("mock timeline event has a numbered ID")
    }

    /// Token for the boundary before the event at `position`; past the end
    /// of the log it denotes the live edge.
    fn token_at(&self, position: usize) -> String {
        match self.events.get(position) {
            Some(event) => format!("t{}", Self::event_number(event)),
            None => format!("t{}", self.counter),
        }
    }

    /// The position a token denotes in the current event log. A token
    /// whose anchor event does not exist (yet) denotes the live edge.
    fn resolve_token(&self, token: &str) -> usize {
        let number: usize = token
            .strip_prefix('t')
            .and_then(|n| n.parse().ok())
            .unwrap_or_else(|| panic!("not a mock timeline token: {token}"));
        let event_id = Self::event_id_at(number);
        self.events
            .iter()
            .position(|e| e["event_id"].as_str() == Some(event_id.as_str()))
            .unwrap_or(self.events.len())
    }

    /// The `next_batch`-style token for the current live position.
    pub fn live_token(&self) -> String {
        self.token_at(self.events.len())
    }

    /// A sync response timeline section: the newest events not yet synced,
    /// at most `limit` of them.
    pub fn sync(&mut self, limit: usize) -> Value {
        let len = self.events.len();
        let pending = len - self.sync_position;
        let limited = pending > limit;
        let from = len - pending.min(limit);
        let events: Vec<Value> = self.events[from..].to_vec();
        self.sync_position = len;
        json!({
            "events": events,
            "limited": limited,
            "prev_batch": self.token_at(from),
        })
    }

    /// A `/messages` response paginating from `from` in `direction`.
    pub fn messages(&self, from: &str, direction: Direction, limit: usize) -> Value {
        let position = self.resolve_token(from);
        match direction {
            Direction::Backward => {
                let to = position.min(self.events.len());
                let begin = to.saturating_sub(limit);
                let mut chunk: Vec<Value> = self.events[begin..to].to_vec();
                chunk.reverse();
                if chunk.is_empty() {
                    json!({"chunk": [], "start": from})
                } else {
                    json!({
                        "chunk": chunk,
                        "start": from,
                        "end": self.token_at(begin),
                    })
                }
            }
            Direction::Forward => {
                let begin = position.min(self.events.len());
                let to = (begin + limit).min(self.events.len());
                let chunk: Vec<Value> = self.events[begin..to].to_vec();
                if chunk.is_empty() {
                    json!({"chunk": [], "start": from})
                } else {
                    json!({
                        "chunk": chunk,
                        "start": from,
                        "end": self.token_at(to),
                    })
                }
            }
        }
    }

    /// A `/context` response centered on `event_id`, with up to `limit`
    /// events on each side.
    pub fn context(&self, event_id: &str, limit: usize) -> Value {
        let index = self
            .events
            .iter()
            .position(|e| e["event_id"].as_str() == Some(event_id))
            .unwrap_or_else(|| panic!("event {event_id} not in mock timeline"));
        let begin = index.saturating_sub(limit);
        let to = (index + 1 + limit).min(self.events.len());
        let mut events_before: Vec<Value> = self.events[begin..index].to_vec();
        events_before.reverse();
        let events_after: Vec<Value> = self.events[index + 1..to].to_vec();
        json!({
            "event": self.events[index],
            "events_before": events_before,
            "events_after": events_after,
            "start": self.token_at(begin),
            "end": self.token_at(to),
        })
    }
}

/// Check the fragment-graph invariants over everything stored for a room.
///
/// Verifies mutual link consistency and that no fragment links to itself.
/// Event-key and event-ID uniqueness are enforced by the storage schema
/// itself. A side that is both linked and gapped is legal: that is the
/// shallow link a limited sync leaves behind until the gap is filled.
pub fn check_fragment_invariants(txn: &StoreTxn<'_>, room_id: &str) -> Result<(), String> {
    let fragments = txn
        .timeline_fragments()
        .all(room_id)
        .map_err(|e| e.to_string())?;
    let by_id: std::collections::HashMap<i64, _> =
        fragments.iter().map(|f| (f.id, f)).collect();

    for fragment in &fragments {
        if fragment.previous_id == Some(fragment.id) || fragment.next_id == Some(fragment.id) {
            return Err(format!("fragment {} links to itself", fragment.id));
        }
        if let Some(next_id) = fragment.next_id {
            let next = by_id
                .get(&next_id)
                .ok_or_else(|| format!("fragment {} links to unknown {next_id}", fragment.id))?;
            if next.previous_id != Some(fragment.id) {
                return Err(format!(
                    "fragment {} -> {next_id} link is not mutual",
                    fragment.id
                ));
            }
        }
        if let Some(previous_id) = fragment.previous_id {
            let previous = by_id.get(&previous_id).ok_or_else(|| {
                format!("fragment {} links to unknown {previous_id}", fragment.id)
            })?;
            if previous.next_id != Some(fragment.id) {
                return Err(format!(
                    "fragment {previous_id} <- {} link is not mutual",
                    fragment.id
                ));
            }
        }
    }
    Ok(())
}
