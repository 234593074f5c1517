//! Ring-bounded heartbeating
//!
//! Each node heartbeats only the next `monitored_by_nr_of_members` nodes on
//! a hash ring instead of every member, which keeps heartbeat traffic linear
//! in cluster size. Unreachable nodes met while walking the ring are
//! monitored in addition so that their recovery is noticed.

use crate::config::FailureDetectorConfig;
use crate::failure_detector::FailureDetectorRegistry;
use crate::gossip::Gossip;
use crate::member::MemberStatus;
use crate::node::UniqueAddress;
use crate::protocol::ClusterMessage;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Position of a node on the heartbeat ring
fn ring_key(node: &UniqueAddress) -> (u64, UniqueAddress) {
    let digest = Sha256::digest(node.to_string().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes), node.clone())
}

/// Nodes ordered by hash, used to choose whom to monitor
#[derive(Debug, Clone)]
pub struct HeartbeatNodeRing {
    self_node: UniqueAddress,
    ring: Vec<(u64, UniqueAddress)>,
    unreachable: BTreeSet<UniqueAddress>,
    monitored_by_nr_of_members: usize,
}

impl HeartbeatNodeRing {
    pub fn new(
        self_node: UniqueAddress,
        nodes: impl IntoIterator<Item = UniqueAddress>,
        unreachable: BTreeSet<UniqueAddress>,
        monitored_by_nr_of_members: usize,
    ) -> Self {
        let mut ring: Vec<_> = nodes
            .into_iter()
            .chain(std::iter::once(self_node.clone()))
            .map(|n| ring_key(&n))
            .collect();
        ring.sort();
        ring.dedup();
        Self {
            self_node,
            ring,
            unreachable,
            monitored_by_nr_of_members,
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &UniqueAddress> {
        self.ring.iter().map(|(_, n)| n)
    }

    /// Nodes `sender` heartbeats: the next reachable ones clockwise, plus
    /// unreachable ones passed on the way
    pub fn receivers(&self, sender: &UniqueAddress) -> BTreeSet<UniqueAddress> {
        let mut receivers = BTreeSet::new();
        let Some(start) = self.ring.iter().position(|(_, n)| n == sender) else {
            return receivers;
        };

        let mut remaining = self.monitored_by_nr_of_members;
        let len = self.ring.len();
        for offset in 1..len {
            if remaining == 0 {
                break;
            }
            let (_, next) = &self.ring[(start + offset) % len];
            if self.unreachable.contains(next) {
                if receivers.len() < self.monitored_by_nr_of_members {
                    receivers.insert(next.clone());
                }
            } else {
                receivers.insert(next.clone());
                remaining -= 1;
            }
        }
        receivers
    }

    pub fn my_receivers(&self) -> BTreeSet<UniqueAddress> {
        self.receivers(&self.self_node)
    }
}

/// Sends heartbeats to the ring receivers and feeds responses into the
/// failure detector
#[derive(Debug)]
pub struct HeartbeatSender {
    self_node: UniqueAddress,
    config: FailureDetectorConfig,
    ring: HeartbeatNodeRing,
    failure_detector: FailureDetectorRegistry,
    seq: u64,
    /// Receivers that have not answered yet, with the time of the first probe
    awaiting_first: HashMap<UniqueAddress, Instant>,
    /// Highest acknowledged sequence number per receiver
    acked: HashMap<UniqueAddress, u64>,
}

impl HeartbeatSender {
    pub fn new(self_node: UniqueAddress, config: FailureDetectorConfig) -> Self {
        let ring = HeartbeatNodeRing::new(
            self_node.clone(),
            std::iter::empty(),
            BTreeSet::new(),
            config.monitored_by_nr_of_members,
        );
        Self {
            failure_detector: FailureDetectorRegistry::new(config.clone()),
            self_node,
            config,
            ring,
            seq: 0,
            awaiting_first: HashMap::new(),
            acked: HashMap::new(),
        }
    }

    pub fn failure_detector(&self) -> &FailureDetectorRegistry {
        &self.failure_detector
    }

    pub fn receivers(&self) -> BTreeSet<UniqueAddress> {
        self.ring.my_receivers()
    }

    /// Rebuild the ring from the latest gossip, forgetting nodes that are no
    /// longer monitored
    pub fn update(&mut self, gossip: &Gossip) {
        let before = self.ring.my_receivers();
        let nodes = gossip
            .members()
            .filter(|m| m.status != MemberStatus::Removed && m.unique_address != self.self_node)
            .map(|m| m.unique_address.clone());
        let unreachable = gossip.reachability().all_unreachable_or_terminated();
        self.ring = HeartbeatNodeRing::new(
            self.self_node.clone(),
            nodes,
            unreachable,
            self.config.monitored_by_nr_of_members,
        );

        let after = self.ring.my_receivers();
        for gone in before.difference(&after) {
            debug!(node = %gone, "stopped heartbeating");
            self.failure_detector.remove(gone);
            self.awaiting_first.remove(gone);
            self.acked.remove(gone);
        }
    }

    /// One heartbeat round: returns the probes to send
    pub fn tick(&mut self, now: Instant) -> Vec<(UniqueAddress, ClusterMessage)> {
        self.seq += 1;
        let receivers = self.ring.my_receivers();

        // Start monitoring receivers that never answered, so a node that is
        // dead from the start is still detected
        let expected_after = self.config.expected_response_after;
        let overdue: Vec<UniqueAddress> = self
            .awaiting_first
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= expected_after)
            .map(|(n, _)| n.clone())
            .collect();
        for node in overdue {
            self.awaiting_first.remove(&node);
            if !self.failure_detector.is_monitoring(&node) {
                debug!(node = %node, "no first heartbeat response, starting detection");
                self.failure_detector.heartbeat(&node, now);
            }
        }

        let mut probes = Vec::with_capacity(receivers.len());
        for node in receivers {
            if !self.failure_detector.is_monitoring(&node) {
                self.awaiting_first.entry(node.clone()).or_insert(now);
            }
            probes.push((node, ClusterMessage::Heartbeat { seq: self.seq }));
        }
        probes
    }

    /// Record a response; duplicates and responses from nodes no longer
    /// monitored are ignored
    pub fn on_response(&mut self, from: &UniqueAddress, seq: u64, now: Instant) {
        if !self.ring.my_receivers().contains(from) {
            trace!(node = %from, seq, "heartbeat response from unmonitored node");
            return;
        }
        let acked = self.acked.entry(from.clone()).or_insert(0);
        if seq <= *acked {
            trace!(node = %from, seq, "stale heartbeat response");
            return;
        }
        *acked = seq;
        self.awaiting_first.remove(from);
        self.failure_detector.heartbeat(from, now);
    }

    pub fn is_available(&self, node: &UniqueAddress, now: Instant) -> bool {
        self.failure_detector.is_available(node, now)
    }
}

/// Answers heartbeats
#[derive(Debug, Default)]
pub struct HeartbeatReceiver;

impl HeartbeatReceiver {
    pub fn on_heartbeat(&self, from: &UniqueAddress, seq: u64) -> ClusterMessage {
        trace!(node = %from, seq, "heartbeat");
        ClusterMessage::HeartbeatRsp { seq }
    }
}
