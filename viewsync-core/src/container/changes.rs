/*
    changes.rs - Element-level change bookkeeping shared by both containers

    Invariants:
    - a key is never both ref-changed and content-changed (ref wins)
    - after clear() nothing is pending
*/

use std::collections::BTreeSet;
use tracing::trace;

#[derive(Debug, Clone)]
pub(crate) struct ChangeSet<K: Ord> {
    ref_changed: BTreeSet<K>,
    content_changed: BTreeSet<K>,
    /// Next emission must be a full snapshot
    pub(crate) must_send_full: bool,
    /// Peer must learn a version bump caused by its own full replace
    pub(crate) version_ack: bool,
}

impl<K: Ord + Clone + std::fmt::Debug> ChangeSet<K> {
    /// A container that was never emitted starts out needing a full send
    pub(crate) fn unsent() -> Self {
        Self {
            ref_changed: BTreeSet::new(),
            content_changed: BTreeSet::new(),
            must_send_full: true,
            version_ack: false,
        }
    }

    pub(crate) fn mark_ref(&mut self, key: K) {
        trace!(?key, "element changed by reference");
        self.content_changed.remove(&key);
        self.ref_changed.insert(key);
    }

    /// Ignored while a ref change for the same key is pending
    pub(crate) fn mark_content(&mut self, key: K) {
        if !self.ref_changed.contains(&key) {
            trace!(?key, "element content updated");
            self.content_changed.insert(key);
        }
    }

    pub(crate) fn forget(&mut self, key: &K) {
        self.ref_changed.remove(key);
        self.content_changed.remove(key);
    }

    pub(crate) fn is_ref_changed(&self, key: &K) -> bool {
        self.ref_changed.contains(key)
    }

    pub(crate) fn is_content_changed(&self, key: &K) -> bool {
        self.content_changed.contains(key)
    }

    pub(crate) fn has_element_changes(&self) -> bool {
        !self.ref_changed.is_empty() || !self.content_changed.is_empty()
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.must_send_full || self.version_ack || self.has_element_changes()
    }

    pub(crate) fn clear(&mut self) {
        self.ref_changed.clear();
        self.content_changed.clear();
        self.must_send_full = false;
        self.version_ack = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_supersedes_content() {
        let mut changes = ChangeSet::<u32>::unsent();
        changes.clear();

        changes.mark_content(1);
        changes.mark_ref(1);
        assert!(changes.is_ref_changed(&1));
        assert!(!changes.is_content_changed(&1));

        // content after ref is swallowed
        changes.mark_content(1);
        assert!(!changes.is_content_changed(&1));
    }

    #[test]
    fn test_unsent_is_pending_until_cleared() {
        let mut changes = ChangeSet::<String>::unsent();
        assert!(changes.is_pending());
        changes.clear();
        assert!(!changes.is_pending());

        changes.mark_content("a".to_string());
        assert!(changes.is_pending());
        changes.forget(&"a".to_string());
        assert!(!changes.is_pending());
    }
}
