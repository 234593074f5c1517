//! Property tests for the convergent membership state
//!
//! Gossip merge must behave like a join on a semilattice (commutative,
//! associative, idempotent) or nodes exchanging state in different orders
//! would never agree.

use murmur_cluster::{
    Address, Gossip, Member, MemberStatus, Reachability, ReachabilityStatus, UniqueAddress,
    VectorClock, VersionOrdering,
};
use murmur_cluster::vector_clock::VClockNode;
use proptest::prelude::*;
use std::collections::BTreeSet;

const NODES: usize = 4;

fn node(i: usize) -> UniqueAddress {
    UniqueAddress::new(Address::new("prop", "127.0.0.1", 2550 + i as u16), i as u64 + 1)
}

fn status_strategy() -> impl Strategy<Value = MemberStatus> {
    prop::sample::select(vec![
        MemberStatus::Joining,
        MemberStatus::Up,
        MemberStatus::Leaving,
        MemberStatus::Exiting,
        MemberStatus::Down,
    ])
}

#[derive(Debug, Clone)]
struct GossipShape {
    members: Vec<Option<(MemberStatus, i32, bool)>>,
    increments: Vec<u8>,
    seen: Vec<bool>,
    reachability: Vec<(usize, usize, u8)>,
    tombstones: Vec<Option<u64>>,
}

fn gossip_shape(with_tombstones: bool) -> impl Strategy<Value = GossipShape> {
    let member = prop::option::of((status_strategy(), 1..5i32, any::<bool>()));
    let tombstone = if with_tombstones {
        prop::option::weighted(0.2, 1..100u64).boxed()
    } else {
        Just(None).boxed()
    };
    (
        prop::collection::vec(member, NODES),
        prop::collection::vec(0..3u8, NODES),
        prop::collection::vec(any::<bool>(), NODES),
        prop::collection::vec((0..NODES, 0..NODES, 0..3u8), 0..6),
        prop::collection::vec(tombstone, NODES),
    )
        .prop_map(
            |(members, increments, seen, reachability, tombstones)| GossipShape {
                members,
                increments,
                seen,
                reachability,
                tombstones,
            },
        )
}

fn build(shape: &GossipShape) -> Gossip {
    let members = shape.members.iter().enumerate().filter_map(|(i, m)| {
        m.map(|(status, up_number, analytics)| {
            let roles: BTreeSet<String> = if analytics {
                BTreeSet::from(["analytics".to_string()])
            } else {
                BTreeSet::new()
            };
            Member {
                status,
                up_number,
                ..Member::new(node(i), roles)
            }
        })
    });
    let mut gossip = Gossip::from_members(members);

    for (i, &count) in shape.increments.iter().enumerate() {
        for _ in 0..count {
            gossip = gossip.increment(&node(i));
        }
    }

    let mut reachability = Reachability::empty();
    for &(observer, subject, op) in &shape.reachability {
        if observer == subject {
            continue;
        }
        reachability = match op {
            0 => reachability.unreachable(&node(observer), &node(subject)),
            1 => reachability.reachable(&node(observer), &node(subject)),
            _ => reachability.terminated(&node(observer), &node(subject)),
        };
    }
    gossip = gossip.with_reachability(reachability);

    for (i, &seen) in shape.seen.iter().enumerate() {
        if seen {
            gossip = gossip.seen(&node(i));
        }
    }

    for (i, tombstone) in shape.tombstones.iter().enumerate() {
        if let Some(at) = tombstone {
            gossip = gossip.remove(&node(i), *at);
        }
    }
    gossip
}

proptest! {
    #[test]
    fn merge_is_commutative(a in gossip_shape(true), b in gossip_shape(true)) {
        let (a, b) = (build(&a), build(&b));
        prop_assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn merge_is_associative(
        a in gossip_shape(false),
        b in gossip_shape(false),
        c in gossip_shape(false),
    ) {
        let (a, b, c) = (build(&a), build(&b), build(&c));
        prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
    }

    #[test]
    fn merge_is_idempotent(a in gossip_shape(true)) {
        let a = build(&a);
        prop_assert_eq!(a.merge(&a), a.clone());
    }

    #[test]
    fn merged_version_dominates_inputs(a in gossip_shape(false), b in gossip_shape(false)) {
        let (a, b) = (build(&a), build(&b));
        let merged = a.merge(&b);
        for input in [&a, &b] {
            prop_assert!(matches!(
                merged.compare_version(input),
                VersionOrdering::After | VersionOrdering::Same
            ));
        }
    }

    #[test]
    fn merge_never_moves_members_backwards(a in gossip_shape(true), b in gossip_shape(true)) {
        let (a, b) = (build(&a), build(&b));
        let merged = a.merge(&b);
        for input in [&a, &b] {
            for member in input.members() {
                match merged.member(&member.unique_address) {
                    Some(m) => prop_assert!(member.status.can_reach(m.status)),
                    None => prop_assert!(merged.is_tombstoned(&member.unique_address)),
                }
            }
        }
    }

    #[test]
    fn tombstoned_nodes_leave_no_trace(a in gossip_shape(true), b in gossip_shape(true)) {
        let merged = build(&a).merge(&build(&b));
        for tombstoned in merged.tombstones().keys() {
            prop_assert!(!merged.has_member(tombstoned));
            prop_assert!(!merged.seen_by_node(tombstoned));
            prop_assert_eq!(merged.version().get(&VClockNode::from(tombstoned)), 0);
            prop_assert!(merged
                .reachability()
                .records()
                .all(|r| &r.observer != tombstoned && &r.subject != tombstoned));
        }
    }

    #[test]
    fn vector_clock_merge_dominates(
        xs in prop::collection::vec(0..4u8, NODES),
        ys in prop::collection::vec(0..4u8, NODES),
    ) {
        let clock = |counts: &[u8]| {
            counts.iter().enumerate().fold(VectorClock::new(), |clock, (i, &n)| {
                (0..n).fold(clock, |c, _| c.increment(&VClockNode::from(&node(i))))
            })
        };
        let (x, y) = (clock(&xs), clock(&ys));
        let merged = x.merge(&y);

        prop_assert!(matches!(merged.compare(&x), VersionOrdering::After | VersionOrdering::Same));
        prop_assert!(matches!(merged.compare(&y), VersionOrdering::After | VersionOrdering::Same));

        let flipped = match x.compare(&y) {
            VersionOrdering::Before => VersionOrdering::After,
            VersionOrdering::After => VersionOrdering::Before,
            other => other,
        };
        prop_assert_eq!(y.compare(&x), flipped);
    }

    #[test]
    fn reachability_merge_prefers_newer_then_suspicion(
        base in prop::collection::vec((0..NODES, 0..NODES, 0..2u8), 0..5),
        observer in 0..NODES,
        subject in 0..NODES,
    ) {
        prop_assume!(observer != subject);
        let mut r = Reachability::empty();
        for (o, s, op) in base {
            if o != s {
                r = if op == 0 {
                    r.unreachable(&node(o), &node(s))
                } else {
                    r.reachable(&node(o), &node(s))
                };
            }
        }
        let (o, s) = (node(observer), node(subject));

        // A fresh observation beats the older one regardless of direction
        let suspected = r.unreachable(&o, &s);
        prop_assert_eq!(
            r.merge(&suspected).status_from(&o, &s),
            suspected.status_from(&o, &s)
        );

        // Two observations with the same version: suspicion wins
        let unreachable = r.unreachable(&o, &s);
        let terminated = r.terminated(&o, &s);
        if unreachable.observer_version(&o) == terminated.observer_version(&o)
            && unreachable != r
        {
            prop_assert_eq!(
                unreachable.merge(&terminated).status_from(&o, &s),
                ReachabilityStatus::Terminated
            );
            prop_assert_eq!(
                terminated.merge(&unreachable).status_from(&o, &s),
                ReachabilityStatus::Terminated
            );
        }
    }
}
