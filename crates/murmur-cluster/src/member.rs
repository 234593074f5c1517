//! Cluster members and the status transition table
//!
//! ```text
//! Joining ──> Up ──> Leaving ──> Exiting ──> Removed
//!    │         │        │           │  ▲
//!    └─────────┴────────┴──> Down <─┘  │
//!                              └───────┘
//! ```
//!
//! Every status may also go straight to `Removed`. `Removed` is terminal.

use crate::error::{ClusterError, Result};
use crate::node::UniqueAddress;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// Up number of a member that has not been moved to `Up` yet
pub const UP_NUMBER_UNASSIGNED: i32 = i32::MAX;

/// Lifecycle status of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    Joining,
    Up,
    Leaving,
    Exiting,
    Down,
    Removed,
}

impl MemberStatus {
    pub const ALL: [MemberStatus; 6] = [
        MemberStatus::Joining,
        MemberStatus::Up,
        MemberStatus::Leaving,
        MemberStatus::Exiting,
        MemberStatus::Down,
        MemberStatus::Removed,
    ];

    /// Direct successors permitted by the transition table
    pub fn allowed_transitions(self) -> &'static [MemberStatus] {
        use MemberStatus::*;
        match self {
            Joining => &[Up, Down, Removed],
            Up => &[Leaving, Down, Removed],
            Leaving => &[Exiting, Down, Removed],
            Exiting => &[Removed, Down],
            Down => &[Removed],
            Removed => &[],
        }
    }

    /// Whether `to` is a direct successor of `self`
    pub fn can_transition_to(self, to: MemberStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Whether `to` equals `self` or lies on some path through the table.
    ///
    /// A node that missed intermediate gossip may observe a member skip
    /// statuses (Joining straight to Leaving), which is still a valid path.
    pub fn can_reach(self, to: MemberStatus) -> bool {
        if self == to {
            return true;
        }
        let mut visited = vec![self];
        let mut frontier = vec![self];
        while let Some(status) = frontier.pop() {
            for &next in status.allowed_transitions() {
                if next == to {
                    return true;
                }
                if !visited.contains(&next) {
                    visited.push(next);
                    frontier.push(next);
                }
            }
        }
        false
    }

    /// Rank used when two views of one member disagree; higher is further along
    pub fn priority(self) -> u8 {
        match self {
            MemberStatus::Joining => 0,
            MemberStatus::Up => 1,
            MemberStatus::Leaving => 2,
            MemberStatus::Exiting => 3,
            MemberStatus::Down => 4,
            MemberStatus::Removed => 5,
        }
    }

    /// Rank used for leader selection: Down last, then Exiting, then Joining
    fn leader_rank(self) -> u8 {
        match self {
            MemberStatus::Up | MemberStatus::Leaving => 0,
            MemberStatus::Joining => 1,
            MemberStatus::Exiting => 2,
            MemberStatus::Down => 3,
            MemberStatus::Removed => 4,
        }
    }
}

/// A node as seen by the membership protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub unique_address: UniqueAddress,
    /// Join-order sequence, [`UP_NUMBER_UNASSIGNED`] until the member is Up
    pub up_number: i32,
    pub status: MemberStatus,
    pub roles: BTreeSet<String>,
}

impl Member {
    /// New `Joining` member
    pub fn new(unique_address: UniqueAddress, roles: BTreeSet<String>) -> Self {
        Self {
            unique_address,
            up_number: UP_NUMBER_UNASSIGNED,
            status: MemberStatus::Joining,
            roles,
        }
    }

    /// Copy with a new status, validated against the transition table
    pub fn copy(&self, status: MemberStatus) -> Result<Member> {
        if self.status == MemberStatus::Removed {
            return Err(ClusterError::RemovedMember(self.unique_address.clone()));
        }
        if self.status == status {
            return Ok(self.clone());
        }
        if !self.status.can_transition_to(status) {
            return Err(ClusterError::InvalidTransition {
                node: self.unique_address.clone(),
                from: self.status,
                to: status,
            });
        }
        Ok(Member {
            status,
            ..self.clone()
        })
    }

    /// Move a `Joining` member to `Up` with its up number
    pub fn copy_up(&self, up_number: i32) -> Result<Member> {
        let mut member = self.copy(MemberStatus::Up)?;
        member.up_number = up_number;
        Ok(member)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Lower up number is older; ties are broken by address
    pub fn is_older_than(&self, other: &Member) -> bool {
        age_ordering(self, other) == Ordering::Less
    }

    pub fn is_up(&self) -> bool {
        self.status == MemberStatus::Up
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member({}, {:?}", self.unique_address, self.status)?;
        if self.up_number != UP_NUMBER_UNASSIGNED {
            write!(f, ", up #{}", self.up_number)?;
        }
        f.write_str(")")
    }
}

/// Identity ordering used for member sets
pub fn address_ordering(a: &Member, b: &Member) -> Ordering {
    a.unique_address.cmp(&b.unique_address)
}

/// Ordering used to pick the leader: Down last, then Exiting, then Joining,
/// remaining ties by address
pub fn leader_status_ordering(a: &Member, b: &Member) -> Ordering {
    a.status
        .leader_rank()
        .cmp(&b.status.leader_rank())
        .then_with(|| address_ordering(a, b))
}

/// Age ordering, oldest first
pub fn age_ordering(a: &Member, b: &Member) -> Ordering {
    a.up_number
        .cmp(&b.up_number)
        .then_with(|| address_ordering(a, b))
}

/// Pick the further-along entry of two views of the same member.
///
/// Symmetric in its arguments. Fails when neither status can reach the other.
pub fn highest_priority_of(a: &Member, b: &Member) -> Result<Member> {
    debug_assert_eq!(a.unique_address, b.unique_address);

    if a.status == b.status {
        let pick = match a.up_number.cmp(&b.up_number) {
            Ordering::Less => a,
            Ordering::Greater => b,
            Ordering::Equal if a.roles <= b.roles => a,
            Ordering::Equal => b,
        };
        return Ok(pick.clone());
    }

    let (low, high) = if a.status.priority() < b.status.priority() {
        (a, b)
    } else {
        (b, a)
    };

    if low.status.can_reach(high.status) {
        Ok(high.clone())
    } else {
        Err(ClusterError::InvalidTransition {
            node: low.unique_address.clone(),
            from: low.status,
            to: high.status,
        })
    }
}
