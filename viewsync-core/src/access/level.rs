/*
    level.rs - Access levels for peer-originated mutations

    Ordered reject < allow < shallow < deep. A child's computed level is
    derived from its parent's computed level and the child's own declared
    level; reject on either side always wins.
*/

use serde::{Deserialize, Serialize};
use std::fmt;

/// How far a peer may reach into a property when mutating it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Peer mutations are never applied
    Reject,
    /// Whole-value assignment from the peer is accepted
    Allow,
    /// Granular by-reference element changes are accepted
    Shallow,
    /// Nested content changes are accepted as well
    Deep,
}

impl AccessLevel {
    /// Level assumed for a root property that declares nothing
    pub const UNDECLARED_ROOT: AccessLevel = AccessLevel::Reject;

    pub fn permits_peer_mutation(self) -> bool {
        self >= AccessLevel::Allow
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::Reject => "reject",
            AccessLevel::Allow => "allow",
            AccessLevel::Shallow => "shallow",
            AccessLevel::Deep => "deep",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computed level of a child given its parent's computed level and the
/// child's own declared level (if any)
pub fn combine(parent: AccessLevel, child_declared: Option<AccessLevel>) -> AccessLevel {
    match child_declared {
        _ if parent == AccessLevel::Reject => AccessLevel::Reject,
        Some(AccessLevel::Reject) => AccessLevel::Reject,
        Some(level) => level,
        None => parent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AccessLevel::*;

    #[test]
    fn test_ordering() {
        assert!(Reject < Allow);
        assert!(Allow < Shallow);
        assert!(Shallow < Deep);
    }

    #[test]
    fn test_combine_reject_dominates() {
        assert_eq!(combine(Reject, Some(Deep)), Reject);
        assert_eq!(combine(Reject, None), Reject);
        assert_eq!(combine(Deep, Some(Reject)), Reject);
    }

    #[test]
    fn test_combine_child_declared_wins_otherwise() {
        // a child may narrow or widen as long as nobody rejects
        assert_eq!(combine(Deep, Some(Allow)), Allow);
        assert_eq!(combine(Allow, Some(Deep)), Deep);
        assert_eq!(combine(Shallow, None), Shallow);
    }

    #[test]
    fn test_permits_peer_mutation() {
        assert!(!Reject.permits_peer_mutation());
        assert!(Allow.permits_peer_mutation());
        assert!(Deep.permits_peer_mutation());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&Shallow).unwrap(), "\"shallow\"");
        assert_eq!(serde_json::from_str::<AccessLevel>("\"deep\"").unwrap(), Deep);
    }
}
