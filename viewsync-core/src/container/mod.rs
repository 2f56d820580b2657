/*
    container - Versioned array and map wrappers

    A container tracks which of its elements changed since the last
    emission and produces either a full snapshot or a granular patch.
    Elements that are themselves containers report their own changes,
    which the parent forwards as content updates.

    Versioning:
    - version starts at 1 and bumps on every full snapshot the server
      emits and on every full replace accepted from the peer
    - granular patches never change the version
    - peer updates carrying a version other than the current one (and
      other than 0, meaning "unversioned") are discarded as conflicts
*/

mod array;
mod changes;
mod map;

pub use array::{ArrayOp, ArrayOpKind, VersionedArray};
pub use map::{MapEntryUpdate, VersionedMap};

use crate::access::AccessLevel;
use crate::types::PropertyType;
use crate::wire::{ContainerUpdate, WireOp};

/// Common surface of both container variants
pub trait VersionedContainer {
    type Op: WireOp;

    /// Version of the content as last agreed with the peer
    fn content_version(&self) -> u64;

    /// True if anything must be sent at the next emission
    fn has_changes(&self) -> bool;

    /// Full value at a new version, or `NoOp` if nothing changed
    fn snapshot(&mut self) -> ContainerUpdate<Self::Op>;

    /// Granular changes, or `NoOp` if nothing changed or a full resend is
    /// pending
    fn patch(&mut self) -> ContainerUpdate<Self::Op>;

    /// Snapshot when a full resend is pending, patch otherwise
    fn to_wire(&mut self) -> ContainerUpdate<Self::Op> {
        if self.needs_full_resend() {
            self.snapshot()
        } else {
            self.patch()
        }
    }

    fn needs_full_resend(&self) -> bool;

    /// Forget pending changes; the peer is now up to date
    fn done_handling(&mut self);

    /// Apply an update from the peer at the given computed access level
    fn apply_incoming(
        &mut self,
        update: ContainerUpdate<Self::Op>,
        ty: &PropertyType,
        level: AccessLevel,
    ) -> IncomingOutcome;

    fn attach(&mut self);

    fn detach(&mut self);

    fn is_attached(&self) -> bool;
}

/// What happened while applying one peer update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingOutcome {
    /// Element operations (or full replaces) applied
    pub applied: usize,
    /// Relative paths of elements the access policy refused
    pub denied: Vec<String>,
    /// The update was discarded because its version was stale
    pub conflict: bool,
    /// Some part will be resent to the peer to undo its optimistic change
    pub resend: bool,
}

impl IncomingOutcome {
    pub fn is_clean(&self) -> bool {
        self.denied.is_empty() && !self.conflict && !self.resend
    }

    pub(crate) fn deny(&mut self, location: String) {
        self.denied.push(location);
        self.resend = true;
    }

    /// Fold a nested element's outcome in, prefixing its denied paths
    pub(crate) fn absorb(&mut self, prefix: &str, child: IncomingOutcome) {
        self.applied += child.applied;
        self.conflict |= child.conflict;
        self.resend |= child.resend;
        self.denied
            .extend(child.denied.into_iter().map(|path| format!("{}{}", prefix, path)));
    }
}
