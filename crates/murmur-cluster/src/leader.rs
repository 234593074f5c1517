//! Leader selection, convergence and automatic status transitions
//!
//! There is no election: every node computes the same leader from the same
//! converged gossip. Leader actions only run on convergence, so two nodes
//! that briefly both believe they lead act on identical state.

use crate::error::Result;
use crate::gossip::Gossip;
use crate::member::{leader_status_ordering, Member, MemberStatus, UP_NUMBER_UNASSIGNED};
use crate::node::UniqueAddress;
use std::collections::BTreeSet;

/// Deterministic leader of a gossip as seen from `self_node`
pub fn leader(gossip: &Gossip, self_node: &UniqueAddress) -> Option<UniqueAddress> {
    gossip
        .members()
        .filter(|m| !matches!(m.status, MemberStatus::Down | MemberStatus::Removed))
        .filter(|m| &m.unique_address == self_node || gossip.is_reachable(&m.unique_address))
        .min_by(|a, b| leader_status_ordering(a, b))
        .map(|m| m.unique_address.clone())
}

pub fn is_leader(gossip: &Gossip, self_node: &UniqueAddress) -> bool {
    leader(gossip, self_node).as_ref() == Some(self_node)
}

/// Whether every relevant member has seen the current version and every
/// unreachable member is already on its way out
pub fn is_converged(gossip: &Gossip, self_node: &UniqueAddress) -> bool {
    if !gossip.has_member(self_node) {
        return false;
    }

    let unreachable = gossip.unreachable_excluding_downed_observers();
    let unreachable_ok = unreachable.iter().all(|node| {
        node == self_node
            || gossip
                .member(node)
                .map(|m| matches!(m.status, MemberStatus::Down | MemberStatus::Exiting))
                .unwrap_or(true)
    });

    let all_seen = gossip
        .members()
        .filter(|m| {
            matches!(
                m.status,
                MemberStatus::Joining | MemberStatus::Up | MemberStatus::Leaving
            )
        })
        .all(|m| gossip.seen_by_node(&m.unique_address));

    unreachable_ok && all_seen
}

/// Transitions performed by one leader round
#[derive(Debug, Clone, Default)]
pub struct LeaderActions {
    pub upped: Vec<Member>,
    pub exiting: Vec<Member>,
    pub removed: Vec<Member>,
}

impl LeaderActions {
    pub fn is_empty(&self) -> bool {
        self.upped.is_empty() && self.exiting.is_empty() && self.removed.is_empty()
    }
}

/// Leader-side transitions for one node
#[derive(Debug, Clone)]
pub struct LeaderLogic {
    self_node: UniqueAddress,
}

impl LeaderLogic {
    pub fn new(self_node: UniqueAddress) -> Self {
        Self { self_node }
    }

    pub fn leader(&self, gossip: &Gossip) -> Option<UniqueAddress> {
        leader(gossip, &self.self_node)
    }

    pub fn is_leader(&self, gossip: &Gossip) -> bool {
        is_leader(gossip, &self.self_node)
    }

    pub fn is_converged(&self, gossip: &Gossip) -> bool {
        is_converged(gossip, &self.self_node)
    }

    /// Compute the leader round on a converged gossip.
    ///
    /// Returns `None` when this node is not the leader, the gossip has not
    /// converged, or there is nothing to do. The returned gossip has not been
    /// re-versioned.
    pub fn actions(&self, gossip: &Gossip, now_ms: u64) -> Result<Option<(Gossip, LeaderActions)>> {
        if !self.is_leader(gossip) || !self.is_converged(gossip) {
            return Ok(None);
        }

        let mut next = gossip.clone();
        let mut actions = LeaderActions::default();

        // Remove first so members promoted in this round are not affected.
        // An Exiting leader only happens when nobody else can take over, so
        // it removes itself.
        let to_remove: Vec<Member> = gossip
            .members()
            .filter(|m| matches!(m.status, MemberStatus::Down | MemberStatus::Exiting))
            .cloned()
            .collect();
        for member in to_remove {
            next = next.remove(&member.unique_address, now_ms);
            actions.removed.push(member.copy(MemberStatus::Removed)?);
        }

        let mut up_number = youngest_up_number(gossip);
        let joining: Vec<Member> = next
            .members()
            .filter(|m| m.status == MemberStatus::Joining)
            .cloned()
            .collect();
        for member in joining {
            up_number += 1;
            let upped = member.copy_up(up_number)?;
            next = next.with_member(upped.clone());
            actions.upped.push(upped);
        }

        let leaving: Vec<Member> = next
            .members()
            .filter(|m| m.status == MemberStatus::Leaving)
            .cloned()
            .collect();
        for member in leaving {
            let exiting = member.copy(MemberStatus::Exiting)?;
            next = next.with_member(exiting.clone());
            actions.exiting.push(exiting);
        }

        if actions.is_empty() {
            return Ok(None);
        }
        Ok(Some((next, actions)))
    }

    /// Members that should be downed according to the set of nodes the
    /// downing policy picked, skipping ones already on their way out
    pub fn downable(&self, gossip: &Gossip, candidates: &BTreeSet<UniqueAddress>) -> Vec<Member> {
        candidates
            .iter()
            .filter_map(|node| gossip.member(node))
            .filter(|m| !matches!(m.status, MemberStatus::Down | MemberStatus::Removed))
            .cloned()
            .collect()
    }
}

/// Highest assigned up number, zero when none has been assigned
fn youngest_up_number(gossip: &Gossip) -> i32 {
    gossip
        .members()
        .map(|m| m.up_number)
        .filter(|&n| n != UP_NUMBER_UNASSIGNED)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Address;
    use crate::reachability::Reachability;

    fn node(port: u16) -> UniqueAddress {
        UniqueAddress::new(Address::new("sys", "127.0.0.1", port), port as u64)
    }

    fn member(n: &UniqueAddress, status: MemberStatus) -> Member {
        Member {
            status,
            ..Member::new(n.clone(), BTreeSet::new())
        }
    }

    fn seen_by_all(g: Gossip) -> Gossip {
        let nodes: Vec<UniqueAddress> = g.members().map(|m| m.unique_address.clone()).collect();
        nodes.iter().fold(g, |g, n| g.seen(n))
    }

    #[test]
    fn test_leader_is_lowest_by_status_then_address() {
        let (a, b, c) = (node(1), node(2), node(3));
        let g = Gossip::from_members([
            member(&a, MemberStatus::Joining),
            member(&b, MemberStatus::Up),
            member(&c, MemberStatus::Up),
        ]);
        assert_eq!(leader(&g, &a), Some(b.clone()));

        // unreachable members are skipped, except self
        let g = g.with_reachability(Reachability::empty().unreachable(&a, &b));
        assert_eq!(leader(&g, &a), Some(c.clone()));
        assert_eq!(leader(&g, &b), Some(b));
    }

    #[test]
    fn test_down_never_leads() {
        let (a, b) = (node(1), node(2));
        let g = Gossip::from_members([member(&a, MemberStatus::Down), member(&b, MemberStatus::Joining)]);
        assert_eq!(leader(&g, &b), Some(b));
    }

    #[test]
    fn test_convergence_requires_seen() {
        let (a, b) = (node(1), node(2));
        let g = Gossip::from_members([member(&a, MemberStatus::Up), member(&b, MemberStatus::Joining)]);
        assert!(!is_converged(&g.seen(&a), &a));
        assert!(is_converged(&seen_by_all(g), &a));
    }

    #[test]
    fn test_convergence_blocked_by_unreachable_up_member() {
        let (a, b, c) = (node(1), node(2), node(3));
        let g = seen_by_all(Gossip::from_members([
            member(&a, MemberStatus::Up),
            member(&b, MemberStatus::Up),
            member(&c, MemberStatus::Up),
        ]));
        let partitioned = g.with_reachability(Reachability::empty().unreachable(&a, &b));
        assert!(!is_converged(&partitioned, &a));

        let downed = partitioned.with_member(member(&b, MemberStatus::Down));
        assert!(is_converged(&downed, &a));

        // observations made by Down members do not count
        let stale = g
            .with_member(member(&b, MemberStatus::Down))
            .with_reachability(Reachability::empty().unreachable(&b, &c));
        assert!(is_converged(&stale, &a));
    }

    #[test]
    fn test_first_up_number_is_one() {
        let (a, b) = (node(1), node(2));
        let g = seen_by_all(Gossip::from_members([
            member(&a, MemberStatus::Up),
            member(&b, MemberStatus::Joining),
        ]));
        let logic = LeaderLogic::new(a.clone());
        let (next, actions) = logic.actions(&g, 0).unwrap().unwrap();

        assert_eq!(actions.upped.len(), 1);
        let b_member = next.member(&b).unwrap();
        assert_eq!(b_member.status, MemberStatus::Up);
        assert_eq!(b_member.up_number, 1);
    }

    #[test]
    fn test_up_numbers_continue_from_youngest() {
        let (a, b, c) = (node(1), node(2), node(3));
        let g = seen_by_all(Gossip::from_members([
            member(&a, MemberStatus::Joining).copy_up(1).unwrap(),
            member(&b, MemberStatus::Joining).copy_up(2).unwrap(),
            member(&c, MemberStatus::Joining),
        ]));
        let (next, _) = LeaderLogic::new(a).actions(&g, 0).unwrap().unwrap();
        assert_eq!(next.member(&c).unwrap().up_number, 3);
    }

    #[test]
    fn test_leaving_exits_then_is_removed() {
        let (a, b) = (node(1), node(2));
        let logic = LeaderLogic::new(a.clone());
        let g = seen_by_all(Gossip::from_members([
            member(&a, MemberStatus::Up),
            member(&b, MemberStatus::Leaving),
        ]));

        let (exiting, actions) = logic.actions(&g, 0).unwrap().unwrap();
        assert_eq!(actions.exiting.len(), 1);
        assert_eq!(exiting.member(&b).unwrap().status, MemberStatus::Exiting);

        let (removed, actions) = logic.actions(&seen_by_all(exiting), 5).unwrap().unwrap();
        assert_eq!(actions.removed.len(), 1);
        assert_eq!(actions.removed[0].status, MemberStatus::Removed);
        assert!(!removed.has_member(&b));
        assert_eq!(removed.tombstones().get(&b), Some(&5));
    }

    #[test]
    fn test_removal_of_versioned_member_can_be_reversioned() {
        let (a, b) = (node(1), node(2));
        let g = seen_by_all(
            Gossip::from_members([member(&a, MemberStatus::Up), member(&b, MemberStatus::Exiting)])
                .increment(&a)
                .increment(&b),
        );

        let (removed, actions) = LeaderLogic::new(a.clone()).actions(&g, 9).unwrap().unwrap();
        assert_eq!(actions.removed.len(), 1);
        let versioned = removed.increment(&a).only_seen(&a);
        assert!(versioned.supersedes(&g));
    }

    #[test]
    fn test_no_actions_without_convergence_or_leadership() {
        let (a, b) = (node(1), node(2));
        let g = Gossip::from_members([member(&a, MemberStatus::Up), member(&b, MemberStatus::Joining)]);
        assert!(LeaderLogic::new(a.clone()).actions(&g.seen(&a), 0).unwrap().is_none());
        assert!(LeaderLogic::new(b).actions(&seen_by_all(g), 0).unwrap().is_none());
    }
}
