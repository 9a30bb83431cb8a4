//! Timeline fragments and their boundary entries.
//!
//! A fragment is a maximal contiguous run of locally-stored events in a
//! room. Each side of a fragment is either linked to a neighbouring
//! fragment, carries a pagination token (an unresolved gap), or has reached
//! the absolute edge of history.

use serde::{Deserialize, Serialize};

use crate::timeline::direction::Direction;

pub type FragmentId = i64;

/// One fragment record, as stored in `timeline_fragments`.
///
/// Owned by storage for the duration of a transaction: read out, mutated
/// in memory, written back. IDs are assigned monotonically per room and
/// never reused; fragments are never deleted.
///
/// Link invariants (protected by the
/// [`FragmentLinker`](crate::timeline::linker::FragmentLinker)):
/// - `previous_id`/`next_id` are mutually consistent with the neighbour's
///   opposite side.
/// - A side the linker resolved never carries both a link and a token; a
///   side with both is a *shallow link* left by a limited sync, waiting
///   for its gap to be filled.
/// - `id` never appears in `previous_id` or `next_id` (no self-links).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    pub room_id: String,
    pub previous_id: Option<FragmentId>,
    pub next_id: Option<FragmentId>,
    pub previous_token: Option<String>,
    pub next_token: Option<String>,
    /// Set when pagination on one side returned nothing: the absolute
    /// beginning or end of the room's history. The affected side's token is
    /// cleared at the same time.
    pub edge_reached: bool,
}

impl Fragment {
    /// A fresh, unlinked fragment.
    pub fn new(id: FragmentId, room_id: impl Into<String>) -> Self {
        Self {
            id,
            room_id: room_id.into(),
            previous_id: None,
            next_id: None,
            previous_token: None,
            next_token: None,
            edge_reached: false,
        }
    }
}

/// One end of a fragment: the fragment plus a direction bit.
///
/// `Backward` designates the start (older) edge, `Forward` the end (newer)
/// edge. All token and link accessors are side-selected through the
/// direction. A boundary entry is transient: it is produced inside a
/// transaction and must not outlive it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentBoundaryEntry {
    fragment: Fragment,
    direction: Direction,
}

impl FragmentBoundaryEntry {
    pub fn new(fragment: Fragment, direction: Direction) -> Self {
        Self {
            fragment,
            direction,
        }
    }

    /// The start (older) edge of `fragment`.
    pub fn start(fragment: Fragment) -> Self {
        Self::new(fragment, Direction::Backward)
    }

    /// The end (newer) edge of `fragment`.
    pub fn end(fragment: Fragment) -> Self {
        Self::new(fragment, Direction::Forward)
    }

    pub fn fragment(&self) -> &Fragment {
        &self.fragment
    }

    pub fn into_fragment(self) -> Fragment {
        self.fragment
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn fragment_id(&self) -> FragmentId {
        self.fragment.id
    }

    pub fn room_id(&self) -> &str {
        &self.fragment.room_id
    }

    /// The pagination token at this edge, if the side is an unresolved gap.
    pub fn token(&self) -> Option<&str> {
        match self.direction {
            Direction::Backward => self.fragment.previous_token.as_deref(),
            Direction::Forward => self.fragment.next_token.as_deref(),
        }
    }

    pub fn set_token(&mut self, token: Option<String>) {
        match self.direction {
            Direction::Backward => self.fragment.previous_token = token,
            Direction::Forward => self.fragment.next_token = token,
        }
    }

    /// The ID of the fragment linked beyond this edge, if any.
    pub fn linked_fragment_id(&self) -> Option<FragmentId> {
        match self.direction {
            Direction::Backward => self.fragment.previous_id,
            Direction::Forward => self.fragment.next_id,
        }
    }

    pub fn set_linked_fragment_id(&mut self, id: Option<FragmentId>) {
        match self.direction {
            Direction::Backward => self.fragment.previous_id = id,
            Direction::Forward => self.fragment.next_id = id,
        }
    }

    pub fn has_linked_fragment(&self) -> bool {
        self.linked_fragment_id().is_some()
    }

    /// Mark this side as the absolute edge of history. Clears the side's
    /// token; there is nothing left to paginate toward.
    pub fn set_edge_reached(&mut self) {
        self.set_token(None);
        self.fragment.edge_reached = true;
    }

    /// A boundary entry for a discovered neighbour fragment, facing back at
    /// this one: the neighbour is joined at its opposite edge.
    pub fn neighbour_entry(&self, fragment: Fragment) -> Self {
        Self::new(fragment, self.direction.reverse())
    }

    /// Rebind to a freshly reloaded fragment record, keeping the direction.
    pub fn with_updated_fragment(&self, fragment: Fragment) -> Self {
        Self::new(fragment, self.direction)
    }
}
