//! Gossip dissemination: target selection and the digest-first exchange
//!
//! ```text
//!  A (initiator)                       B (receiver)
//!    │ ── GossipStatus{version,digest} ──> │
//!    │                                     │  B newer/concurrent/seen differs
//!    │ <──────── GossipEnvelope ────────── │
//!    │                                     │  B older
//!    │ <──────── GossipStatus ──────────── │  (pull: A pushes its envelope)
//! ```
//!
//! The decisions are pure functions over the local gossip; the coordinator
//! performs the sends and applies the resulting state.

use crate::config::GossipConfig;
use crate::gossip::Gossip;
use crate::member::{Member, MemberStatus};
use crate::node::UniqueAddress;
use crate::protocol::ClusterMessage;
use crate::reachability::ReachabilityStatus;
use crate::vector_clock::{VectorClock, VersionOrdering};
use rand::seq::IteratorRandom;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Reply to an incoming `GossipStatus`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReply {
    /// Remote is ahead, ask for its state by sending ours as status
    Pull,
    /// We are ahead, concurrent, or seen sets differ
    Push,
    /// Same version and same seen set
    Nothing,
}

/// How a received gossip related to the local one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveKind {
    Older,
    Newer,
    Same,
    Merged,
}

/// Why an incoming envelope was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Expired,
    NotMember,
    UnknownSender,
    QuarantinedSender,
    MissingSelf,
}

/// Result of handling a `GossipEnvelope`
#[derive(Debug, Clone)]
pub enum GossipReceive {
    Dropped(DropReason),
    /// The remote gossip shows this node removed
    SelfRemoved(Gossip),
    Applied {
        gossip: Gossip,
        kind: ReceiveKind,
        /// Remote entries refused because they moved a member backwards
        rejected: Vec<Member>,
        /// Whether the sender should get the resulting envelope
        reply: bool,
    },
}

/// Peer selection and exchange decisions for one node
#[derive(Debug, Clone)]
pub struct GossipDisseminator {
    self_node: UniqueAddress,
    config: GossipConfig,
}

impl GossipDisseminator {
    pub fn new(self_node: UniqueAddress, config: GossipConfig) -> Self {
        Self { self_node, config }
    }

    pub fn time_to_live(&self) -> Duration {
        self.config.gossip_time_to_live
    }

    /// Preference for peers with a different view, reduced for large clusters
    pub fn different_view_probability(&self, cluster_size: usize) -> f64 {
        let base = self.config.different_view_probability;
        let low = self.config.reduce_gossip_different_view_probability;
        let high = low.saturating_mul(3);
        if cluster_size <= low {
            return base;
        }
        let min = base / 3.0;
        if cluster_size >= high {
            return min;
        }
        let slope = (min - base) / (high - low) as f64;
        base + (cluster_size - low) as f64 * slope
    }

    /// Members eligible as gossip targets: not self, reachable from self
    fn candidates<'a>(&'a self, gossip: &'a Gossip) -> impl Iterator<Item = &'a Member> + 'a {
        gossip.members().filter(move |m| {
            m.unique_address != self.self_node
                && m.status != MemberStatus::Removed
                && gossip
                    .reachability()
                    .is_reachable_from(&self.self_node, &m.unique_address)
        })
    }

    pub fn select_target(&self, gossip: &Gossip) -> Option<UniqueAddress> {
        self.select_target_with(gossip, &mut rand::thread_rng())
    }

    /// Pick the next peer; with some probability prefer peers that have not
    /// seen the current version
    pub fn select_target_with<R: Rng>(&self, gossip: &Gossip, rng: &mut R) -> Option<UniqueAddress> {
        let probability = self.different_view_probability(gossip.member_count());
        if rng.gen::<f64>() < probability {
            let unseen = self
                .candidates(gossip)
                .filter(|m| !gossip.seen_by_node(&m.unique_address))
                .choose(rng);
            if let Some(m) = unseen {
                return Some(m.unique_address.clone());
            }
        }
        self.candidates(gossip)
            .choose(rng)
            .map(|m| m.unique_address.clone())
    }

    pub fn status_message(&self, gossip: &Gossip) -> ClusterMessage {
        ClusterMessage::GossipStatus {
            version: gossip.version().clone(),
            seen_digest: gossip.seen_digest(),
        }
    }

    pub fn envelope_message(&self, gossip: &Gossip) -> ClusterMessage {
        ClusterMessage::GossipEnvelope {
            gossip: gossip.clone(),
        }
    }

    /// Decide the reply to a remote status digest
    pub fn on_status(
        &self,
        local: &Gossip,
        remote_version: &VectorClock,
        remote_digest: &[u8; 32],
    ) -> StatusReply {
        match local.version().compare(remote_version) {
            VersionOrdering::Before => StatusReply::Pull,
            VersionOrdering::After | VersionOrdering::Concurrent => StatusReply::Push,
            VersionOrdering::Same if &local.seen_digest() != remote_digest => StatusReply::Push,
            VersionOrdering::Same => StatusReply::Nothing,
        }
    }

    /// Apply a remote envelope to the local gossip
    pub fn on_envelope(
        &self,
        local: &Gossip,
        from: &UniqueAddress,
        remote: &Gossip,
        received_at: Instant,
        now: Instant,
    ) -> GossipReceive {
        if now.saturating_duration_since(received_at) > self.config.gossip_time_to_live {
            return GossipReceive::Dropped(DropReason::Expired);
        }
        if remote.is_tombstoned(&self.self_node) {
            return GossipReceive::SelfRemoved(remote.clone());
        }
        if !local.has_member(&self.self_node) {
            return GossipReceive::Dropped(DropReason::NotMember);
        }
        if !local.has_member(from) {
            return GossipReceive::Dropped(DropReason::UnknownSender);
        }
        if local.reachability().status_from(&self.self_node, from) == ReachabilityStatus::Terminated {
            return GossipReceive::Dropped(DropReason::QuarantinedSender);
        }
        if !remote.has_member(&self.self_node) {
            return GossipReceive::Dropped(DropReason::MissingSelf);
        }

        let (merged, kind, rejected) = match remote.compare_version(local) {
            VersionOrdering::Same => (local.merge_seen(remote), ReceiveKind::Same, vec![]),
            VersionOrdering::Before => (local.clone(), ReceiveKind::Older, vec![]),
            VersionOrdering::After => {
                let (adopted, rejected) = local.adopt_newer(remote);
                (adopted, ReceiveKind::Newer, rejected)
            }
            VersionOrdering::Concurrent => (local.merge(remote), ReceiveKind::Merged, vec![]),
        };

        let gossip = merged.seen(&self.self_node);
        let reply = match kind {
            ReceiveKind::Older | ReceiveKind::Merged => true,
            ReceiveKind::Newer | ReceiveKind::Same => {
                !rejected.is_empty()
                    || !gossip.seen_by_node(from)
                    || gossip.seen_digest() != remote.seen_digest()
            }
        };

        GossipReceive::Applied {
            gossip,
            kind,
            rejected,
            reply,
        }
    }
}
