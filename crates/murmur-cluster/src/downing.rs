//! Downing policies
//!
//! Marking an unreachable member `Down` is a decision the membership core
//! does not take by itself. The leader consults a [`DowningStrategy`] on
//! every reaper tick and gossips the resulting transitions.

use crate::gossip::Gossip;
use crate::member::MemberStatus;
use crate::node::UniqueAddress;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Policy deciding which unreachable members to down
pub trait DowningStrategy: Send + Debug {
    /// Nodes to mark `Down`, evaluated by the leader only
    fn nodes_to_down(&mut self, gossip: &Gossip, now: Instant) -> BTreeSet<UniqueAddress>;
}

/// Never downs automatically; operators call `down` explicitly
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDowning;

impl DowningStrategy for NoDowning {
    fn nodes_to_down(&mut self, _gossip: &Gossip, _now: Instant) -> BTreeSet<UniqueAddress> {
        BTreeSet::new()
    }
}

/// Downs members that stay unreachable longer than a fixed duration
#[derive(Debug)]
pub struct AutoDownUnreachableAfter {
    after: Duration,
    unreachable_since: HashMap<UniqueAddress, Instant>,
}

impl AutoDownUnreachableAfter {
    pub fn new(after: Duration) -> Self {
        Self {
            after,
            unreachable_since: HashMap::new(),
        }
    }
}

impl DowningStrategy for AutoDownUnreachableAfter {
    fn nodes_to_down(&mut self, gossip: &Gossip, now: Instant) -> BTreeSet<UniqueAddress> {
        let unreachable = gossip.reachability().all_unreachable_or_terminated();
        self.unreachable_since
            .retain(|node, _| unreachable.contains(node));

        let mut to_down = BTreeSet::new();
        for node in unreachable {
            let pending = gossip
                .member(&node)
                .map(|m| !matches!(m.status, MemberStatus::Down | MemberStatus::Removed))
                .unwrap_or(false);
            if !pending {
                self.unreachable_since.remove(&node);
                continue;
            }
            let since = *self.unreachable_since.entry(node.clone()).or_insert(now);
            if now.saturating_duration_since(since) >= self.after {
                info!(node = %node, after = ?self.after, "auto-downing unreachable member");
                to_down.insert(node);
            }
        }
        to_down
    }
}

/// Strategy configured by `auto_down_unreachable_after`
pub fn from_config(auto_down_unreachable_after: Option<Duration>) -> Box<dyn DowningStrategy> {
    match auto_down_unreachable_after {
        Some(after) => Box::new(AutoDownUnreachableAfter::new(after)),
        None => Box::new(NoDowning),
    }
}
