//! Timeline gap-filling and fragment-stitching engine.
//!
//! A room's locally-stored history is a set of *fragments*: contiguous runs
//! of events, doubly linked to their neighbours once the store has proof
//! they are contiguous, and bounded by pagination tokens (gaps) otherwise.
//! The writers in this module ingest server responses and keep that graph
//! intact:
//!
//! - [`SyncWriter`] appends live events and opens a new fragment when a
//!   sync was limited.
//! - [`GapWriter`] fills gaps from `/messages` responses and materializes
//!   `/context` responses, detecting overlap with stored events and linking
//!   fragments when overlap proves contiguity.
//! - [`FragmentIdComparer`] derives a partial order over fragment IDs from
//!   the link graph; callers feed it the changed fragments of a write
//!   *after* committing the transaction.
//!
//! The policy throughout is: strict about invariants (fail loudly rather
//! than corrupt the graph), lenient about known server peculiarities (drop
//! bad data, log a warning, proceed).

pub mod comparer;
pub mod direction;
pub mod entries;
pub mod event_key;
pub mod fragment;
pub mod gap_writer;
pub mod inserter;
pub mod linker;
pub mod overlap;
pub mod sync_writer;

pub use comparer::{CompareError, FragmentIdComparer};
pub use direction::Direction;
pub use entries::{directional_append, EventEntry, TimelineEntry};
pub use event_key::EventKey;
pub use fragment::{Fragment, FragmentBoundaryEntry, FragmentId};
pub use gap_writer::{GapFillResult, GapWriter};
pub use sync_writer::{SyncWriteResult, SyncWriter};

use crate::events::{Event, ResponseError};
use crate::storage::StorageError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Fatal failures of the timeline writers.
///
/// Any of these aborts the current call with the surrounding transaction
/// uncommitted; storage is left untouched. Recoverable conditions
/// (self-link candidates, fully-overlapping chunks) never surface here;
/// they are logged and compensated for in place.
#[derive(Debug)]
pub enum GapError {
    Storage(StorageError),
    MalformedResponse(ResponseError),
    /// The response was fetched with a token the fragment no longer
    /// carries; writing it would corrupt the timeline.
    StaleToken {
        expected: Option<String>,
        got: String,
    },
    UnknownFragment(FragmentId),
    /// Refused to overwrite an existing fragment link with a different
    /// one. Indicates a client bug.
    LinkConflict {
        fragment_id: FragmentId,
        existing: FragmentId,
        candidate: FragmentId,
    },
    InvariantViolation(String),
}

impl std::fmt::Display for GapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GapError::Storage(e) => write!(f, "storage error: {e}"),
            GapError::MalformedResponse(e) => write!(f, "malformed response: {e}"),
            GapError::StaleToken { expected, got } => write!(
                f,
                "stale token: response for {got:?}, fragment expects {expected:?}"
            ),
            GapError::UnknownFragment(id) => write!(f, "unknown fragment: {id}"),
            GapError::LinkConflict {
                fragment_id,
                existing,
                candidate,
            } => write!(
                f,
                "fragment {fragment_id} is already linked to {existing}, \
                 refusing link to {candidate}"
            ),
            GapError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for GapError {}

impl From<StorageError> for GapError {
    fn from(e: StorageError) -> Self {
        GapError::Storage(e)
    }
}

impl From<ResponseError> for GapError {
    fn from(e: ResponseError) -> Self {
        GapError::MalformedResponse(e)
    }
}

/// The event ID of an event that must have one. Response parsing enforces
/// it, so failing here means a writer was handed events that bypassed
/// validation.
pub(crate) fn required_event_id(event: &Event) -> Result<&str, GapError> {
    event
        .event_id()
        .ok_or_else(|| GapError::InvariantViolation("event without an event_id".to_string()))
}
