//! Cluster events derived by diffing successive gossips

use crate::gossip::Gossip;
use crate::leader::leader;
use crate::member::{Member, MemberStatus};
use crate::node::{Address, UniqueAddress};
use std::collections::BTreeSet;

/// Membership change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A member appeared with status Joining
    MemberJoined(Member),
    /// A member moved to Up
    MemberUp(Member),
    /// A member started leaving
    MemberLeft(Member),
    /// A member was moved to Exiting by the leader
    MemberExited(Member),
    /// A member was marked Down
    MemberDowned(Member),
    /// A member was removed from the cluster
    MemberRemoved {
        member: Member,
        previous_status: MemberStatus,
    },
    /// Some observer considers the member unreachable
    UnreachableMember(Member),
    /// All observers consider the member reachable again
    ReachableMember(Member),
    /// The leader changed, `None` when there is no leader
    LeaderChanged(Option<Address>),
}

/// Snapshot of the membership view of one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentClusterState {
    pub members: Vec<Member>,
    pub unreachable: Vec<Member>,
    pub seen_by: BTreeSet<Address>,
    pub leader: Option<Address>,
}

impl CurrentClusterState {
    pub fn from_gossip(gossip: &Gossip, self_node: &UniqueAddress) -> Self {
        let unreachable = unreachable_members(gossip, self_node);
        Self {
            members: gossip.members().cloned().collect(),
            unreachable: gossip
                .members()
                .filter(|m| unreachable.contains(&m.unique_address))
                .cloned()
                .collect(),
            seen_by: gossip.seen_by().iter().map(|n| n.address.clone()).collect(),
            leader: leader(gossip, self_node).map(|n| n.address),
        }
    }

    pub fn member(&self, address: &Address) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| &m.unique_address.address == address)
    }

    pub fn member_status(&self, address: &Address) -> Option<MemberStatus> {
        self.member(address).map(|m| m.status)
    }
}

fn unreachable_members(gossip: &Gossip, self_node: &UniqueAddress) -> BTreeSet<UniqueAddress> {
    gossip
        .reachability()
        .all_unreachable_or_terminated()
        .into_iter()
        .filter(|n| n != self_node && gossip.has_member(n))
        .collect()
}

fn status_event(member: &Member) -> Option<ClusterEvent> {
    let member = member.clone();
    match member.status {
        MemberStatus::Joining => Some(ClusterEvent::MemberJoined(member)),
        MemberStatus::Up => Some(ClusterEvent::MemberUp(member)),
        MemberStatus::Leaving => Some(ClusterEvent::MemberLeft(member)),
        MemberStatus::Exiting => Some(ClusterEvent::MemberExited(member)),
        MemberStatus::Down => Some(ClusterEvent::MemberDowned(member)),
        MemberStatus::Removed => None,
    }
}

/// Events that turn `old` into `new`, in a stable order: member changes,
/// removals, reachability changes, then leader change
pub fn diff(old: &Gossip, new: &Gossip, self_node: &UniqueAddress) -> Vec<ClusterEvent> {
    let mut events = Vec::new();

    for member in new.members() {
        let changed = old
            .member(&member.unique_address)
            .map(|previous| previous.status != member.status)
            .unwrap_or(true);
        if changed {
            events.extend(status_event(member));
        }
    }

    for previous in old.members() {
        if !new.has_member(&previous.unique_address) {
            let member = Member {
                status: MemberStatus::Removed,
                ..previous.clone()
            };
            events.push(ClusterEvent::MemberRemoved {
                member,
                previous_status: previous.status,
            });
        }
    }

    let old_unreachable = unreachable_members(old, self_node);
    let new_unreachable = unreachable_members(new, self_node);
    for node in new_unreachable.difference(&old_unreachable) {
        if let Some(m) = new.member(node) {
            events.push(ClusterEvent::UnreachableMember(m.clone()));
        }
    }
    for node in old_unreachable.difference(&new_unreachable) {
        if let Some(m) = new.member(node) {
            events.push(ClusterEvent::ReachableMember(m.clone()));
        }
    }

    let old_leader = leader(old, self_node);
    let new_leader = leader(new, self_node);
    if old_leader != new_leader {
        events.push(ClusterEvent::LeaderChanged(new_leader.map(|n| n.address)));
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn test_join_and_up_events() {
        let (a, b) = (node(1), node(2));
        let old = Gossip::empty();
        let joined = Gossip::from_members([member(&a, MemberStatus::Joining)]);
        let events = diff(&old, &joined, &a);
        assert_eq!(
            events,
            vec![
                ClusterEvent::MemberJoined(member(&a, MemberStatus::Joining)),
                ClusterEvent::LeaderChanged(Some(a.address.clone())),
            ]
        );

        let up = joined
            .with_member(member(&a, MemberStatus::Joining).copy_up(1).unwrap())
            .with_member(member(&b, MemberStatus::Joining));
        let events = diff(&joined, &up, &a);
        assert!(matches!(&events[0], ClusterEvent::MemberUp(m) if m.unique_address == a));
        assert!(matches!(&events[1], ClusterEvent::MemberJoined(m) if m.unique_address == b));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_removed_event() {
        let (a, b) = (node(1), node(2));
        let old = Gossip::from_members([member(&a, MemberStatus::Up), member(&b, MemberStatus::Exiting)]);
        let new = old.remove(&b, 1);
        let events = diff(&old, &new, &a);
        assert_eq!(
            events,
            vec![ClusterEvent::MemberRemoved {
                member: member(&b, MemberStatus::Removed),
                previous_status: MemberStatus::Exiting,
            }]
        );
    }

    #[test]
    fn test_reachability_events() {
        let (a, b, c) = (node(1), node(2), node(3));
        let g = Gossip::from_members([
            member(&a, MemberStatus::Up),
            member(&b, MemberStatus::Up),
            member(&c, MemberStatus::Up),
        ]);
        let r = Reachability::empty().unreachable(&a, &c);
        let partitioned = g.with_reachability(r.clone());

        assert_eq!(
            diff(&g, &partitioned, &a),
            vec![ClusterEvent::UnreachableMember(member(&c, MemberStatus::Up))]
        );
        let healed = g.with_reachability(r.reachable(&a, &c));
        assert_eq!(
            diff(&partitioned, &healed, &a),
            vec![ClusterEvent::ReachableMember(member(&c, MemberStatus::Up))]
        );
    }

    #[test]
    fn test_leader_change_on_unreachable_leader() {
        let (a, b) = (node(1), node(2));
        let g = Gossip::from_members([member(&a, MemberStatus::Up), member(&b, MemberStatus::Up)]);
        let partitioned = g.with_reachability(Reachability::empty().unreachable(&b, &a));
        let events = diff(&g, &partitioned, &b);
        assert!(events.contains(&ClusterEvent::LeaderChanged(Some(b.address.clone()))));
    }

    #[test]
    fn test_current_state_snapshot() {
        let (a, b) = (node(1), node(2));
        let g = Gossip::from_members([member(&a, MemberStatus::Up), member(&b, MemberStatus::Up)])
            .seen(&a)
            .with_reachability(Reachability::empty().unreachable(&a, &b));
        let state = CurrentClusterState::from_gossip(&g, &a);

        assert_eq!(state.members.len(), 2);
        assert_eq!(state.leader, Some(a.address.clone()));
        assert_eq!(state.unreachable.len(), 1);
        assert!(state.seen_by.contains(&a.address));
        assert_eq!(state.member_status(&b.address), Some(MemberStatus::Up));
    }
}
