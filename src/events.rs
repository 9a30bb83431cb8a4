//! Room event model and server response shapes.
//!
//! ## Wire shapes
//! - An [`Event`] is an opaque bag of server-side fields; the store only
//!   interprets a handful of them (`event_id`, `sender`, `type`,
//!   `state_key`, `content`, `unsigned.prev_content`).
//! - Event identity is `event_id`, unique per room. The store never orders
//!   events by their content; ordering comes from storage keys.
//! - [`MessagesResponse`] and [`ContextResponse`] are the two pagination
//!   response shapes the gap-filling engine ingests; [`SyncTimeline`] is the
//!   live-edge shape consumed by the sync writer.
//!
//! Response constructors validate shape up front (`from_json`) so the engine
//! itself only ever sees well-formed input; a malformed response is surfaced
//! to the caller before any storage write happens.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type of room membership state events.
pub const MEMBER_EVENT_TYPE: &str = "m.room.member";

/// Relation type for emoji annotations (reactions).
pub const ANNOTATION_REL_TYPE: &str = "m.annotation";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A server response that does not have the documented shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    NotAnObject,
    MissingField(&'static str),
    NotASequence(&'static str),
    NotAString(&'static str),
    /// An element of the named event sequence has no string `event_id`.
    MalformedEvent(&'static str),
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseError::NotAnObject => write!(f, "response is not an object"),
            ResponseError::MissingField(field) => write!(f, "missing field: {field}"),
            ResponseError::NotASequence(field) => write!(f, "{field} is not a sequence"),
            ResponseError::NotAString(field) => write!(f, "{field} is not a string"),
            ResponseError::MalformedEvent(field) => {
                write!(f, "{field} contains an event without an event_id")
            }
        }
    }
}

impl std::error::Error for ResponseError {}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A server-side room event.
///
/// Stored and passed around as raw JSON; accessors pull out the fields the
/// timeline store interprets. Anything else is carried along untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Value);

impl Event {
    pub fn new(value: Value) -> Self {
        Event(value)
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }

    fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Globally unique event ID. Identity of the event within its room.
    pub fn event_id(&self) -> Option<&str> {
        self.str_field("event_id")
    }

    pub fn sender(&self) -> Option<&str> {
        self.str_field("sender")
    }

    pub fn event_type(&self) -> Option<&str> {
        self.str_field("type")
    }

    pub fn state_key(&self) -> Option<&str> {
        self.str_field("state_key")
    }

    pub fn content(&self) -> Option<&Value> {
        self.0.get("content")
    }

    /// The content this event replaced, for state events.
    ///
    /// Servers put it in `unsigned.prev_content`; very old ones used a
    /// top-level `prev_content` field, which is still accepted.
    pub fn prev_content(&self) -> Option<&Value> {
        self.0
            .get("unsigned")
            .and_then(|u| u.get("prev_content"))
            .or_else(|| self.0.get("prev_content"))
    }

    /// Whether this is the membership state event for `user_id`.
    pub fn is_member_event_for(&self, user_id: &str) -> bool {
        self.event_type() == Some(MEMBER_EVENT_TYPE) && self.state_key() == Some(user_id)
    }

    /// The relation this event declares on another event, if any.
    pub fn relation(&self) -> Option<Relation> {
        let relates_to = self.content()?.get("m.relates_to")?;
        let rel_type = relates_to.get("rel_type")?.as_str()?.to_string();
        let event_id = relates_to.get("event_id")?.as_str()?.to_string();
        let key = relates_to
            .get("key")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Relation {
            rel_type,
            event_id,
            key,
        })
    }
}

/// A relation one event declares on another (`content["m.relates_to"]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub rel_type: String,
    /// Target event ID.
    pub event_id: String,
    /// Annotation key (the emoji), present for `m.annotation`.
    pub key: Option<String>,
}

// ---------------------------------------------------------------------------
// Member snapshots
// ---------------------------------------------------------------------------

/// Display-name/avatar snapshot taken from a member event's content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemberSnapshot {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl MemberSnapshot {
    /// Read the snapshot out of a member event's `content` (or
    /// `prev_content`) object.
    pub fn from_member_content(content: &Value) -> Self {
        Self {
            display_name: content
                .get("displayname")
                .and_then(Value::as_str)
                .map(str::to_string),
            avatar_url: content
                .get("avatar_url")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.avatar_url.is_none()
    }
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

fn take_events(value: &Value, field: &'static str) -> Result<Vec<Event>, ResponseError> {
    let seq = value
        .get(field)
        .ok_or(ResponseError::MissingField(field))?
        .as_array()
        .ok_or(ResponseError::NotASequence(field))?;
    let events: Vec<Event> = seq.iter().cloned().map(Event::new).collect();
    if events.iter().any(|e| e.event_id().is_none()) {
        return Err(ResponseError::MalformedEvent(field));
    }
    Ok(events)
}

fn take_string(value: &Value, field: &'static str) -> Result<String, ResponseError> {
    value
        .get(field)
        .ok_or(ResponseError::MissingField(field))?
        .as_str()
        .ok_or(ResponseError::NotAString(field))
        .map(str::to_string)
}

fn take_optional_string(
    value: &Value,
    field: &'static str,
) -> Result<Option<String>, ResponseError> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .ok_or(ResponseError::NotAString(field))
            .map(|s| Some(s.to_string())),
    }
}

fn take_optional_events(value: &Value, field: &'static str) -> Result<Vec<Event>, ResponseError> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => {
            let seq = v.as_array().ok_or(ResponseError::NotASequence(field))?;
            Ok(seq.iter().cloned().map(Event::new).collect())
        }
    }
}

/// A `/messages` pagination response.
///
/// `chunk` is reverse-chronological for a backward request and
/// chronological for a forward one. `end` is absent when the server has
/// reached the edge of history.
#[derive(Debug, Clone)]
pub struct MessagesResponse {
    pub chunk: Vec<Event>,
    pub start: String,
    pub end: Option<String>,
    pub state: Vec<Event>,
}

impl MessagesResponse {
    pub fn from_json(value: &Value) -> Result<Self, ResponseError> {
        if !value.is_object() {
            return Err(ResponseError::NotAnObject);
        }
        Ok(Self {
            chunk: take_events(value, "chunk")?,
            start: take_string(value, "start")?,
            end: take_optional_string(value, "end")?,
            state: take_optional_events(value, "state")?,
        })
    }
}

/// A `/context` response, centered on one event.
///
/// `events_before` is reverse-chronological, `events_after` chronological;
/// both pagination tokens are always present.
#[derive(Debug, Clone)]
pub struct ContextResponse {
    pub event: Event,
    pub events_before: Vec<Event>,
    pub events_after: Vec<Event>,
    pub start: String,
    pub end: String,
    pub state: Vec<Event>,
}

impl ContextResponse {
    pub fn from_json(value: &Value) -> Result<Self, ResponseError> {
        if !value.is_object() {
            return Err(ResponseError::NotAnObject);
        }
        let event = value
            .get("event")
            .cloned()
            .map(Event::new)
            .ok_or(ResponseError::MissingField("event"))?;
        if event.event_id().is_none() {
            return Err(ResponseError::MalformedEvent("event"));
        }
        Ok(Self {
            event,
            events_before: take_events(value, "events_before")?,
            events_after: take_events(value, "events_after")?,
            start: take_string(value, "start")?,
            end: take_string(value, "end")?,
            state: take_optional_events(value, "state")?,
        })
    }
}

/// The timeline section of one room in a sync response.
#[derive(Debug, Clone)]
pub struct SyncTimeline {
    /// Chronological events at the live edge.
    pub events: Vec<Event>,
    /// True when the server truncated the timeline; history between the
    /// previous live position and `events[0]` must be backfilled through
    /// `prev_batch`.
    pub limited: bool,
    pub prev_batch: Option<String>,
}

impl SyncTimeline {
    pub fn from_json(value: &Value) -> Result<Self, ResponseError> {
        if !value.is_object() {
            return Err(ResponseError::NotAnObject);
        }
        Ok(Self {
            events: take_events(value, "events")?,
            limited: value
                .get("limited")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            prev_batch: take_optional_string(value, "prev_batch")?,
        })
    }
}
