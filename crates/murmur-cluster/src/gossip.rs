//! Replicated cluster state
//!
//! A [`Gossip`] is a pure value: the member set, the vector clock version,
//! the overview (which nodes have seen this version and the reachability
//! records) and the tombstones of removed members. Every local mutation goes
//! through the coordinator, which bumps the version afterwards.
//!
//! [`Gossip::merge`] is commutative, associative and idempotent, so nodes
//! that exchange state in any order end up with the same value.

use crate::member::{highest_priority_of, Member, MemberStatus};
use crate::node::{Address, UniqueAddress};
use crate::reachability::Reachability;
use crate::vector_clock::{VClockNode, VectorClock, VersionOrdering};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Member set keyed and ordered by identity
pub type Members = BTreeMap<UniqueAddress, Member>;

/// Which nodes have seen the current version, plus reachability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipOverview {
    pub seen: BTreeSet<UniqueAddress>,
    pub reachability: Reachability,
}

/// Cluster state exchanged between nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gossip {
    members: Members,
    overview: GossipOverview,
    version: VectorClock,
    /// Removed identities with their removal time in unix millis
    tombstones: BTreeMap<UniqueAddress, u64>,
}

impl Gossip {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Typed empty member set
    pub fn empty_members() -> Members {
        Members::new()
    }

    pub fn from_members(members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            members: members
                .into_iter()
                .map(|m| (m.unique_address.clone(), m))
                .collect(),
            ..Self::default()
        }
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member(&self, node: &UniqueAddress) -> Option<&Member> {
        self.members.get(node)
    }

    /// Current incarnation at `address`, if any
    pub fn member_by_address(&self, address: &Address) -> Option<&Member> {
        self.members
            .values()
            .find(|m| &m.unique_address.address == address)
    }

    pub fn has_member(&self, node: &UniqueAddress) -> bool {
        self.members.contains_key(node)
    }

    pub fn version(&self) -> &VectorClock {
        &self.version
    }

    pub fn overview(&self) -> &GossipOverview {
        &self.overview
    }

    pub fn reachability(&self) -> &Reachability {
        &self.overview.reachability
    }

    pub fn seen_by(&self) -> &BTreeSet<UniqueAddress> {
        &self.overview.seen
    }

    pub fn tombstones(&self) -> &BTreeMap<UniqueAddress, u64> {
        &self.tombstones
    }

    pub fn is_tombstoned(&self, node: &UniqueAddress) -> bool {
        self.tombstones.contains_key(node)
    }

    /// Insert or replace a member entry
    pub fn with_member(&self, member: Member) -> Gossip {
        let mut next = self.clone();
        next.members.insert(member.unique_address.clone(), member);
        next
    }

    pub fn with_reachability(&self, reachability: Reachability) -> Gossip {
        let mut next = self.clone();
        next.overview.reachability = reachability;
        next
    }

    /// Drop a member for good: tombstone it, prune its clock entry and
    /// forget everything observed by or about it
    pub fn remove(&self, node: &UniqueAddress, removed_at_ms: u64) -> Gossip {
        let mut next = self.clone();
        next.members.remove(node);
        next.overview.seen.remove(node);
        next.overview.reachability = next.overview.reachability.remove([node]);
        next.version = next.version.prune(&VClockNode::from(node));
        let entry = next.tombstones.entry(node.clone()).or_insert(removed_at_ms);
        *entry = (*entry).max(removed_at_ms);
        next
    }

    /// Forget tombstones removed before `cutoff_ms`
    pub fn prune_tombstones(&self, cutoff_ms: u64) -> Gossip {
        if self.tombstones.values().all(|&t| t >= cutoff_ms) {
            return self.clone();
        }
        let mut next = self.clone();
        next.tombstones.retain(|_, t| *t >= cutoff_ms);
        next
    }

    /// Bump the version on behalf of `node`
    pub fn increment(&self, node: &UniqueAddress) -> Gossip {
        let mut next = self.clone();
        next.version = self.version.increment(&VClockNode::from(node));
        next
    }

    /// Mark `node` as having seen the current version
    pub fn seen(&self, node: &UniqueAddress) -> Gossip {
        if self.overview.seen.contains(node) {
            return self.clone();
        }
        let mut next = self.clone();
        next.overview.seen.insert(node.clone());
        next
    }

    /// Reset the seen set to `node` alone
    pub fn only_seen(&self, node: &UniqueAddress) -> Gossip {
        let mut next = self.clone();
        next.overview.seen = BTreeSet::from([node.clone()]);
        next
    }

    pub fn clear_seen(&self) -> Gossip {
        let mut next = self.clone();
        next.overview.seen.clear();
        next
    }

    pub fn seen_by_node(&self, node: &UniqueAddress) -> bool {
        self.overview.seen.contains(node)
    }

    /// Union the seen sets of two gossips with the same version
    pub fn merge_seen(&self, other: &Gossip) -> Gossip {
        let mut next = self.clone();
        next.overview
            .seen
            .extend(other.overview.seen.iter().cloned());
        next
    }

    /// SHA-256 over the sorted seen set
    pub fn seen_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for node in &self.overview.seen {
            hasher.update(node.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hasher.finalize().into()
    }

    /// Whether the member is not marked unreachable by any observer
    pub fn is_reachable(&self, node: &UniqueAddress) -> bool {
        self.overview.reachability.is_reachable(node)
    }

    /// Members some non-Down observer reports as unreachable
    pub fn unreachable_excluding_downed_observers(&self) -> BTreeSet<UniqueAddress> {
        let downed: Vec<&UniqueAddress> = self
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Down)
            .map(|m| &m.unique_address)
            .collect();
        self.overview
            .reachability
            .remove_observers(downed)
            .all_unreachable_or_terminated()
            .into_iter()
            .filter(|node| self.members.contains_key(node))
            .collect()
    }

    /// Combine two versions of the cluster state.
    ///
    /// Per member the further-along status wins. Tombstoned members, their
    /// clock entries and their reachability records are dropped. The seen
    /// set survives only from inputs whose version equals the result.
    pub fn merge(&self, other: &Gossip) -> Gossip {
        let mut tombstones = self.tombstones.clone();
        for (node, &at) in &other.tombstones {
            let entry = tombstones.entry(node.clone()).or_insert(at);
            *entry = (*entry).max(at);
        }

        let mut members = Gossip::empty_members();
        for (node, member) in self.members.iter().chain(other.members.iter()) {
            if tombstones.contains_key(node) {
                continue;
            }
            let merged = match members.get(node) {
                None => member.clone(),
                Some(existing) => match highest_priority_of(existing, member) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(node = %node, error = %e, "conflicting member entries in merge");
                        pick_by_priority(existing, member)
                    }
                },
            };
            members.insert(node.clone(), merged);
        }

        let mut version = self.version.merge(&other.version);
        for node in tombstones.keys() {
            version = version.prune(&VClockNode::from(node));
        }

        let reachability = self
            .overview
            .reachability
            .merge(&other.overview.reachability)
            .remove(tombstones.keys());

        let mut seen = BTreeSet::new();
        for input in [self, other] {
            if input.version == version {
                seen.extend(input.overview.seen.iter().cloned());
            }
        }
        seen.retain(|node| !tombstones.contains_key(node));

        Gossip {
            members,
            overview: GossipOverview { seen, reachability },
            version,
            tombstones,
        }
    }

    /// Adopt a strictly newer remote gossip while refusing entries that
    /// would move a locally known member backwards.
    ///
    /// Returns the corrected gossip and the refused remote entries. Local
    /// members missing from the newer gossip must have been tombstoned.
    pub fn adopt_newer(&self, newer: &Gossip) -> (Gossip, Vec<Member>) {
        let mut adopted = newer.clone();
        let mut rejected = Vec::new();

        for (node, local) in &self.members {
            if newer.tombstones.contains_key(node) {
                continue;
            }
            match newer.members.get(node) {
                Some(remote) if !local.status.can_reach(remote.status) => {
                    rejected.push(remote.clone());
                    adopted.members.insert(node.clone(), local.clone());
                }
                Some(_) => {}
                None => {
                    adopted.members.insert(node.clone(), local.clone());
                }
            }
        }

        for (node, &at) in &self.tombstones {
            if !adopted.tombstones.contains_key(node) {
                adopted = adopted.remove(node, at);
            }
        }

        (adopted, rejected)
    }

    /// Causal relation of this version against `other`
    pub fn compare_version(&self, other: &Gossip) -> VersionOrdering {
        self.version.compare(&other.version)
    }

    /// Strictly newer than `previous`, ignoring clock entries of nodes
    /// tombstoned here since removal prunes them
    pub fn supersedes(&self, previous: &Gossip) -> bool {
        let previous = self
            .tombstones
            .keys()
            .fold(previous.version.clone(), |clock, node| {
                clock.prune(&VClockNode::from(node))
            });
        self.version.dominates(&previous)
    }
}

fn pick_by_priority(a: &Member, b: &Member) -> Member {
    if (b.status.priority(), &b.unique_address) > (a.status.priority(), &a.unique_address) {
        b.clone()
    } else {
        a.clone()
    }
}
