//! Per-object dirty bookkeeping
//!
//! Two disjoint name sets. Marking a name ref-changed removes it from the
//! content set; marking a ref-changed name content-changed does nothing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a property changed since the last flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Replaced by a different value; sent in full
    Ref,
    /// Same container, changed contents; sent as a patch
    Content,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtySet {
    ref_changed: BTreeSet<String>,
    content_changed: BTreeSet<String>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ref(&mut self, name: &str) {
        self.content_changed.remove(name);
        self.ref_changed.insert(name.to_string());
    }

    /// Returns false when the name was already ref-changed
    pub fn mark_content(&mut self, name: &str) -> bool {
        if self.ref_changed.contains(name) {
            return false;
        }
        self.content_changed.insert(name.to_string());
        true
    }

    pub fn kind(&self, name: &str) -> Option<ChangeKind> {
        if self.ref_changed.contains(name) {
            Some(ChangeKind::Ref)
        } else if self.content_changed.contains(name) {
            Some(ChangeKind::Content)
        } else {
            None
        }
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.kind(name).is_some()
    }

    /// Remove `name` from whichever set holds it
    pub fn take(&mut self, name: &str) -> Option<ChangeKind> {
        let kind = self.kind(name)?;
        self.ref_changed.remove(name);
        self.content_changed.remove(name);
        Some(kind)
    }

    /// Every dirty name, sorted
    pub fn names(&self) -> Vec<String> {
        self.ref_changed
            .union(&self.content_changed)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ref_changed.len() + self.content_changed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ref_changed.is_empty() && self.content_changed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sets_stay_disjoint() {
        let mut dirty = DirtySet::new();
        assert!(dirty.mark_content("a"));
        dirty.mark_ref("a");
        assert_eq!(dirty.kind("a"), Some(ChangeKind::Ref));
        assert!(!dirty.mark_content("a"));
        assert_eq!(dirty.len(), 1);
    }

    #[test]
    fn test_take_clears_one_name() {
        let mut dirty = DirtySet::new();
        dirty.mark_ref("b");
        dirty.mark_content("a");
        assert_eq!(dirty.names(), vec!["a".to_string(), "b".to_string()]);

        assert_eq!(dirty.take("a"), Some(ChangeKind::Content));
        assert_eq!(dirty.take("a"), None);
        assert!(dirty.is_dirty("b"));
        assert!(!dirty.is_empty());
    }
}
