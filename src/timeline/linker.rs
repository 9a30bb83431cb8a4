//! Linking fragments once overlap has proven them contiguous.

use crate::storage::StoreTxn;
use crate::timeline::entries::{directional_append, TimelineEntry};
use crate::timeline::fragment::{Fragment, FragmentBoundaryEntry};
use crate::timeline::GapError;

/// Mutates fragment boundary entries into a verified link, or records the
/// continuation token when there is nothing to link to.
///
/// A link is only ever written onto an unset side; a side already linked
/// to a *different* fragment is a client bug and fails the call rather
/// than silently rewiring the graph.
pub struct FragmentLinker<'a> {
    room_id: &'a str,
}

impl<'a> FragmentLinker<'a> {
    pub fn new(room_id: &'a str) -> Self {
        Self { room_id }
    }

    /// Join `fragment_entry` to `neighbour_fragment_entry`, or stamp
    /// `end_token` onto `fragment_entry` when no neighbour was found.
    ///
    /// Both touched boundary entries are appended to `entries`
    /// directionally, reflecting their persisted state. Returns the
    /// fragments whose links changed; the caller hands those to the
    /// fragment ID comparer after committing.
    pub fn update_fragments(
        &self,
        mut fragment_entry: FragmentBoundaryEntry,
        neighbour_fragment_entry: Option<FragmentBoundaryEntry>,
        end_token: Option<String>,
        entries: &mut Vec<TimelineEntry>,
        txn: &StoreTxn<'_>,
    ) -> Result<Vec<Fragment>, GapError> {
        let direction = fragment_entry.direction();
        let mut changed_fragments = Vec::new();

        match neighbour_fragment_entry {
            Some(mut neighbour_entry) => {
                if neighbour_entry.fragment_id() == fragment_entry.fragment_id() {
                    return Err(GapError::InvariantViolation(format!(
                        "fragment {} in {} cannot link to itself",
                        fragment_entry.fragment_id(),
                        self.room_id
                    )));
                }
                Self::set_linked_fragment(&mut fragment_entry, neighbour_entry.fragment_id())?;
                Self::set_linked_fragment(&mut neighbour_entry, fragment_entry.fragment_id())?;

                // both sides of the join are resolved now; the tokens that
                // used to span the gap are redundant
                fragment_entry.set_token(None);
                neighbour_entry.set_token(None);

                txn.timeline_fragments().update(neighbour_entry.fragment())?;
                changed_fragments.push(fragment_entry.fragment().clone());
                changed_fragments.push(neighbour_entry.fragment().clone());
                txn.timeline_fragments().update(fragment_entry.fragment())?;

                directional_append(entries, TimelineEntry::Boundary(fragment_entry), direction);
                directional_append(entries, TimelineEntry::Boundary(neighbour_entry), direction);
            }
            None => {
                // no neighbour: the edge stays a gap, resumable at the
                // token the server handed back
                fragment_entry.set_token(end_token);
                txn.timeline_fragments().update(fragment_entry.fragment())?;
                directional_append(entries, TimelineEntry::Boundary(fragment_entry), direction);
            }
        }

        Ok(changed_fragments)
    }

    /// Set one side's link, refusing to overwrite a conflicting one.
    fn set_linked_fragment(
        entry: &mut FragmentBoundaryEntry,
        neighbour_id: i64,
    ) -> Result<(), GapError> {
        match entry.linked_fragment_id() {
            None => {
                entry.set_linked_fragment_id(Some(neighbour_id));
                Ok(())
            }
            Some(existing) if existing == neighbour_id => Ok(()),
            Some(existing) => Err(GapError::LinkConflict {
                fragment_id: entry.fragment_id(),
                existing,
                candidate: neighbour_id,
            }),
        }
    }
}
