//! Vector clocks for ordering gossip versions
//!
//! A clock maps node keys to logical counters. Two clocks are either the same,
//! ordered (one happened before the other) or concurrent. Concurrent gossip
//! versions must be merged, never overwritten.

use crate::node::UniqueAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Key of a node entry inside a vector clock
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VClockNode(String);

impl VClockNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&UniqueAddress> for VClockNode {
    fn from(node: &UniqueAddress) -> Self {
        Self(node.to_string())
    }
}

impl fmt::Display for VClockNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Causal relation between two clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    /// `self` happened before `other`
    Before,
    /// `self` happened after `other`
    After,
    /// Neither clock contains the other
    Concurrent,
    Same,
}

/// Vector clock, a pure value type
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorClock {
    versions: BTreeMap<VClockNode, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `node`, zero when absent
    pub fn get(&self, node: &VClockNode) -> u64 {
        self.versions.get(node).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &VClockNode> {
        self.versions.keys()
    }

    /// New clock with `node`'s counter bumped by one
    pub fn increment(&self, node: &VClockNode) -> VectorClock {
        let mut versions = self.versions.clone();
        *versions.entry(node.clone()).or_insert(0) += 1;
        VectorClock { versions }
    }

    /// Pointwise maximum over the union of keys
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut versions = self.versions.clone();
        for (node, &counter) in &other.versions {
            let entry = versions.entry(node.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
        VectorClock { versions }
    }

    /// Drop the entry of a node that left the cluster for good
    pub fn prune(&self, node: &VClockNode) -> VectorClock {
        if !self.versions.contains_key(node) {
            return self.clone();
        }
        let mut versions = self.versions.clone();
        versions.remove(node);
        VectorClock { versions }
    }

    /// Causal comparison of `self` against `other`
    pub fn compare(&self, other: &VectorClock) -> VersionOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for (node, &counter) in &self.versions {
            let theirs = other.get(node);
            if counter > theirs {
                self_ahead = true;
            } else if counter < theirs {
                other_ahead = true;
            }
        }
        for (node, &counter) in &other.versions {
            if !self.versions.contains_key(node) && counter > 0 {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => VersionOrdering::Same,
            (true, false) => VersionOrdering::After,
            (false, true) => VersionOrdering::Before,
            (true, true) => VersionOrdering::Concurrent,
        }
    }

    /// Every entry of `other` is <= ours and the clocks differ
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other) == VersionOrdering::After
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == VersionOrdering::Concurrent
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VectorClock(")?;
        for (i, (node, counter)) in self.versions.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} -> {}", node, counter)?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(name: &str) -> VClockNode {
        VClockNode::new(name)
    }

    #[test]
    fn test_increment_dominates_input() {
        let clock = VectorClock::new().increment(&n("a"));
        let next = clock.increment(&n("a"));

        assert_eq!(next.get(&n("a")), 2);
        assert!(next.dominates(&clock));
        assert_eq!(clock.compare(&next), VersionOrdering::Before);
    }

    #[test]
    fn test_concurrent_and_merge() {
        let base = VectorClock::new().increment(&n("a"));
        let left = base.increment(&n("a"));
        let right = base.increment(&n("b"));

        assert_eq!(left.compare(&right), VersionOrdering::Concurrent);
        assert!(!left.dominates(&right));
        assert!(!right.dominates(&left));

        let merged = left.merge(&right);
        assert_eq!(merged.get(&n("a")), 2);
        assert_eq!(merged.get(&n("b")), 1);
        assert!(merged.dominates(&left));
        assert!(merged.dominates(&right));
    }

    #[test]
    fn test_same_is_not_dominating() {
        let a = VectorClock::new().increment(&n("x")).increment(&n("y"));
        let b = VectorClock::new().increment(&n("y")).increment(&n("x"));

        assert_eq!(a.compare(&b), VersionOrdering::Same);
        assert!(!a.dominates(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_before_anything() {
        let empty = VectorClock::new();
        let one = empty.increment(&n("a"));
        assert_eq!(empty.compare(&one), VersionOrdering::Before);
        assert_eq!(one.compare(&empty), VersionOrdering::After);
        assert_eq!(empty.compare(&VectorClock::new()), VersionOrdering::Same);
    }

    #[test]
    fn test_prune_removes_entry() {
        let clock = VectorClock::new().increment(&n("a")).increment(&n("b"));
        let pruned = clock.prune(&n("b"));

        assert_eq!(pruned.get(&n("b")), 0);
        assert_eq!(pruned.nodes().count(), 1);
        assert_eq!(pruned.prune(&n("missing")), pruned);
    }
}
