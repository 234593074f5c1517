//! Cluster coordinator - the single writer of the membership state
//!
//! One task owns the authoritative [`Gossip`]. Commands from
//! [`ClusterHandle`]s, inbound transport events and timer ticks all arrive
//! as [`CoordinatorEvent`]s on one queue and are processed in order, so no
//! locking is needed around the state.
//!
//! ```text
//!   ClusterHandle ──┐
//!   transport rx ───┼──> mpsc<CoordinatorEvent> ──> run loop ──> Transport::send
//!   tickers ────────┘                                  │
//!                                                      └──> broadcast<ClusterEvent>
//! ```

use crate::config::ClusterConfig;
use crate::dissemination::{GossipDisseminator, GossipReceive, StatusReply};
use crate::downing::{self, DowningStrategy};
use crate::error::{ClusterError, Result};
use crate::events::{diff, ClusterEvent, CurrentClusterState};
use crate::gossip::Gossip;
use crate::heartbeat::{HeartbeatReceiver, HeartbeatSender};
use crate::leader::LeaderLogic;
use crate::member::{Member, MemberStatus};
use crate::node::{Address, UniqueAddress};
use crate::observability::{FailureDetectorMetrics, GossipMetrics, MembershipMetrics};
use crate::protocol::{ClusterMessage, Envelope};
use crate::reachability::ReachabilityStatus;
use crate::transport::{Transport, TransportEvent};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Capacity of the coordinator event queue
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the cluster event broadcast channel
const CLUSTER_EVENT_CAPACITY: usize = 1024;

/// Set once an oversized envelope has been reported
static OVERSIZE_WARNED: AtomicBool = AtomicBool::new(false);

/// Request from a [`ClusterHandle`]
#[derive(Debug)]
pub enum Command {
    Join {
        seed: Address,
        reply: oneshot::Sender<Result<()>>,
    },
    JoinSeedNodes {
        seeds: Vec<Address>,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        address: Address,
        reply: oneshot::Sender<Result<()>>,
    },
    Down {
        address: Address,
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        reply: oneshot::Sender<CurrentClusterState>,
    },
    LatestGossip {
        reply: oneshot::Sender<Gossip>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Periodic work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Gossip,
    Heartbeat,
    LeaderActions,
    ReapUnreachable,
    JoinRetry,
}

/// Everything the run loop reacts to
#[derive(Debug)]
pub enum CoordinatorEvent {
    Command(Command),
    Transport(TransportEvent),
    Tick(Tick),
}

enum Flow {
    Continue,
    Stop,
}

/// Background tasks feeding the event queue, aborted as a unit
#[derive(Debug, Default)]
struct PeriodicTasks {
    handles: Vec<JoinHandle<()>>,
}

impl PeriodicTasks {
    fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    fn ticker(
        &mut self,
        tx: mpsc::Sender<CoordinatorEvent>,
        tick: Tick,
        initial_delay: Duration,
        period: Duration,
    ) {
        self.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + initial_delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.send(CoordinatorEvent::Tick(tick)).await.is_err() {
                    break;
                }
            }
        }));
    }

    fn abort_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for PeriodicTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Join in progress
#[derive(Debug)]
struct JoinAttempt {
    seeds: Vec<Address>,
    next: usize,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Answer a command, keeping fatal errors for the run loop
fn respond<T>(reply: oneshot::Sender<Result<T>>, result: Result<T>) -> Result<()> {
    match result {
        Err(e) if e.is_fatal() => {
            let _ = reply.send(Err(ClusterError::ShuttingDown));
            Err(e)
        }
        other => {
            let _ = reply.send(other);
            Ok(())
        }
    }
}

/// Owner of the membership state for one node
pub struct ClusterCoordinator<T: Transport> {
    config: ClusterConfig,
    self_node: UniqueAddress,
    transport: Arc<T>,
    latest_gossip: Gossip,
    disseminator: GossipDisseminator,
    leader: LeaderLogic,
    heartbeat_sender: HeartbeatSender,
    heartbeat_receiver: HeartbeatReceiver,
    downing: Box<dyn DowningStrategy>,
    join: Option<JoinAttempt>,
    joined: bool,
    inbound: Option<mpsc::Receiver<TransportEvent>>,
    events_tx: mpsc::Sender<CoordinatorEvent>,
    events_rx: mpsc::Receiver<CoordinatorEvent>,
    cluster_events: broadcast::Sender<ClusterEvent>,
    tasks: PeriodicTasks,
}

impl<T: Transport> ClusterCoordinator<T> {
    /// Create a coordinator with a fresh random uid
    pub fn new(
        config: ClusterConfig,
        transport: T,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Result<(Self, ClusterHandle)> {
        let self_node = UniqueAddress::random(config.self_address());
        Self::with_identity(config, self_node, transport, inbound)
    }

    /// Create a coordinator for a given incarnation
    pub fn with_identity(
        config: ClusterConfig,
        self_node: UniqueAddress,
        transport: T,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Result<(Self, ClusterHandle)> {
        config.validate()?;
        if self_node.address != config.self_address() {
            return Err(ClusterError::InvalidConfig(format!(
                "identity {} does not match configured address {}",
                self_node,
                config.self_address()
            )));
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (cluster_events, _) = broadcast::channel(CLUSTER_EVENT_CAPACITY);

        let handle = ClusterHandle {
            self_node: self_node.clone(),
            commands: events_tx.clone(),
            cluster_events: cluster_events.clone(),
        };

        let coordinator = Self {
            disseminator: GossipDisseminator::new(self_node.clone(), config.gossip.clone()),
            leader: LeaderLogic::new(self_node.clone()),
            heartbeat_sender: HeartbeatSender::new(
                self_node.clone(),
                config.failure_detector.clone(),
            ),
            heartbeat_receiver: HeartbeatReceiver,
            downing: downing::from_config(config.leader.auto_down_unreachable_after),
            config,
            self_node,
            transport: Arc::new(transport),
            latest_gossip: Gossip::empty(),
            join: None,
            joined: false,
            inbound: Some(inbound),
            events_tx,
            events_rx,
            cluster_events,
            tasks: PeriodicTasks::default(),
        };
        Ok((coordinator, handle))
    }

    /// Replace the downing policy
    pub fn with_downing_strategy(mut self, strategy: Box<dyn DowningStrategy>) -> Self {
        self.downing = strategy;
        self
    }

    pub fn self_node(&self) -> &UniqueAddress {
        &self.self_node
    }

    /// Create and spawn a coordinator
    pub fn spawn(
        config: ClusterConfig,
        transport: T,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Result<(ClusterHandle, JoinHandle<Result<()>>)> {
        let (coordinator, handle) = Self::new(config, transport, inbound)?;
        Ok((handle, tokio::spawn(coordinator.run())))
    }

    /// Run the event loop until shutdown, removal or a fatal error
    pub async fn run(mut self) -> Result<()> {
        info!(node = %self.self_node, "cluster coordinator starting");
        self.start_tasks();

        if !self.config.seed_nodes.is_empty() {
            let seeds = self.config.seed_nodes.clone();
            if let Err(e) = self.join_seed_nodes(seeds) {
                warn!(node = %self.self_node, error = %e, "initial join failed");
            }
        }

        let result = loop {
            let Some(event) = self.events_rx.recv().await else {
                break Ok(());
            };
            match self.handle_event(event) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break Ok(()),
                Err(e) if e.is_fatal() => {
                    error!(node = %self.self_node, error = %e, "fatal error, stopping coordinator");
                    break Err(e);
                }
                Err(e) => {
                    warn!(node = %self.self_node, error = %e, "error handling event");
                }
            }
        };

        self.tasks.abort_all();
        info!(node = %self.self_node, "cluster coordinator stopped");
        result
    }

    fn start_tasks(&mut self) {
        let gossip = &self.config.gossip;
        let leader = &self.config.leader;
        let initial = gossip.periodic_tasks_initial_delay;

        let schedule = [
            (Tick::Gossip, initial, gossip.gossip_interval),
            (
                Tick::Heartbeat,
                initial,
                self.config.failure_detector.heartbeat_interval,
            ),
            (Tick::LeaderActions, initial, leader.leader_actions_interval),
            (
                Tick::ReapUnreachable,
                initial,
                leader.unreachable_nodes_reaper_interval,
            ),
            (
                Tick::JoinRetry,
                gossip.retry_unsuccessful_join_after,
                gossip.retry_unsuccessful_join_after,
            ),
        ];
        for (tick, delay, period) in schedule {
            self.tasks.ticker(self.events_tx.clone(), tick, delay, period);
        }

        if let Some(mut inbound) = self.inbound.take() {
            let tx = self.events_tx.clone();
            self.tasks.push(tokio::spawn(async move {
                while let Some(event) = inbound.recv().await {
                    if tx.send(CoordinatorEvent::Transport(event)).await.is_err() {
                        break;
                    }
                }
            }));
        }
    }

    fn handle_event(&mut self, event: CoordinatorEvent) -> Result<Flow> {
        let flow = match event {
            CoordinatorEvent::Command(command) => self.handle_command(command)?,
            CoordinatorEvent::Transport(event) => self.handle_transport(event)?,
            CoordinatorEvent::Tick(tick) => {
                self.handle_tick(tick)?;
                Flow::Continue
            }
        };

        if matches!(flow, Flow::Continue) && self.self_exited() {
            self.on_self_exited();
            return Ok(Flow::Stop);
        }
        Ok(flow)
    }

    // ==================== Commands ====================

    fn handle_command(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::Join { seed, reply } => {
                let result = self.join_seed_nodes(vec![seed]);
                respond(reply, result)?;
            }
            Command::JoinSeedNodes { seeds, reply } => {
                let result = self.join_seed_nodes(seeds);
                respond(reply, result)?;
            }
            Command::Leave { address, reply } => {
                let result = self.leave(&address);
                respond(reply, result)?;
            }
            Command::Down { address, reply } => {
                let result = self.down(&address);
                respond(reply, result)?;
            }
            Command::State { reply } => {
                let _ = reply.send(CurrentClusterState::from_gossip(
                    &self.latest_gossip,
                    &self.self_node,
                ));
            }
            Command::LatestGossip { reply } => {
                let _ = reply.send(self.latest_gossip.clone());
            }
            Command::Shutdown { reply } => {
                let result = self.shutdown();
                let _ = reply.send(());
                result?;
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn is_member(&self) -> bool {
        self.latest_gossip.has_member(&self.self_node)
    }

    fn join_seed_nodes(&mut self, seeds: Vec<Address>) -> Result<()> {
        if seeds.is_empty() {
            return Err(ClusterError::NoSeedNodes);
        }
        if self.is_member() {
            debug!(node = %self.self_node, "already a member, ignoring join");
            return Ok(());
        }
        if seeds[0] == self.self_node.address {
            return self.join_self();
        }

        let seeds: Vec<Address> = seeds
            .into_iter()
            .filter(|s| s != &self.self_node.address)
            .collect();
        self.join = Some(JoinAttempt { seeds, next: 0 });
        self.send_join();
        Ok(())
    }

    /// First node of a new cluster
    fn join_self(&mut self) -> Result<()> {
        info!(node = %self.self_node, "joining self, starting new cluster");
        self.join = None;
        let gossip = Gossip::from_members([Member::new(
            self.self_node.clone(),
            self.config.roles.clone(),
        )]);
        self.update_latest_gossip(gossip)
    }

    fn send_join(&mut self) {
        let seed = match self.join.as_mut() {
            Some(attempt) if !attempt.seeds.is_empty() => {
                let seed = attempt.seeds[attempt.next % attempt.seeds.len()].clone();
                attempt.next += 1;
                seed
            }
            _ => return,
        };
        info!(node = %self.self_node, seed = %seed, "sending join request");
        let message = ClusterMessage::Join {
            node: self.self_node.clone(),
            roles: self.config.roles.clone(),
        };
        self.send(seed, None, message);
    }

    fn leave(&mut self, address: &Address) -> Result<()> {
        let member = self
            .latest_gossip
            .member_by_address(address)
            .cloned()
            .ok_or_else(|| ClusterError::MemberNotFound(address.clone()))?;
        if member.status == MemberStatus::Leaving {
            return Ok(());
        }
        let leaving = member.copy(MemberStatus::Leaving)?;
        info!(node = %member.unique_address, "marking member as Leaving");
        self.update_latest_gossip(self.latest_gossip.with_member(leaving))?;
        self.gossip_round();
        Ok(())
    }

    fn down(&mut self, address: &Address) -> Result<()> {
        let member = self
            .latest_gossip
            .member_by_address(address)
            .cloned()
            .ok_or_else(|| ClusterError::MemberNotFound(address.clone()))?;
        if member.status == MemberStatus::Down {
            return Ok(());
        }
        let down = member.copy(MemberStatus::Down)?;
        info!(node = %member.unique_address, "marking member as Down");
        MembershipMetrics::increment_downed();
        self.update_latest_gossip(self.latest_gossip.with_member(down))?;
        self.gossip_round();
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        info!(node = %self.self_node, "shutting down");
        if let Some(member) = self.latest_gossip.member(&self.self_node).cloned() {
            if member.status == MemberStatus::Up {
                let leaving = member.copy(MemberStatus::Leaving)?;
                self.update_latest_gossip(self.latest_gossip.with_member(leaving))?;
            }
            self.push_to_reachable_peers();
        }
        Ok(())
    }

    // ==================== Transport ====================

    fn handle_transport(&mut self, event: TransportEvent) -> Result<Flow> {
        match event {
            TransportEvent::Quarantined(node) => {
                self.on_quarantined(&node)?;
                Ok(Flow::Continue)
            }
            TransportEvent::Message {
                envelope,
                received_at,
            } => self.handle_message(envelope, received_at),
        }
    }

    fn on_quarantined(&mut self, node: &UniqueAddress) -> Result<()> {
        if !self.latest_gossip.has_member(node) || node == &self.self_node {
            return Ok(());
        }
        let reachability = self.latest_gossip.reachability();
        if reachability.status_from(&self.self_node, node) == ReachabilityStatus::Terminated {
            return Ok(());
        }
        warn!(node = %node, "association quarantined, marking terminated");
        let terminated = reachability.terminated(&self.self_node, node);
        self.update_latest_gossip(self.latest_gossip.with_reachability(terminated))
    }

    fn handle_message(&mut self, envelope: Envelope, received_at: Instant) -> Result<Flow> {
        if !envelope.is_addressed_to(&self.self_node) {
            debug!(
                from = %envelope.from,
                kind = envelope.message.kind(),
                "dropping message for another incarnation"
            );
            return Ok(Flow::Continue);
        }
        trace!(from = %envelope.from, kind = envelope.message.kind(), "received");

        let from = envelope.from;
        match envelope.message {
            ClusterMessage::Join { node, roles } => self.on_join(node, roles)?,
            ClusterMessage::Welcome { gossip } => self.on_welcome(&from, gossip),
            ClusterMessage::GossipStatus {
                version,
                seen_digest,
            } => {
                if self.is_member() && self.latest_gossip.has_member(&from) {
                    match self
                        .disseminator
                        .on_status(&self.latest_gossip, &version, &seen_digest)
                    {
                        StatusReply::Pull => {
                            let status = self.disseminator.status_message(&self.latest_gossip);
                            self.send_to_node(&from, status);
                        }
                        StatusReply::Push => self.send_envelope(&from),
                        StatusReply::Nothing => {}
                    }
                }
            }
            ClusterMessage::GossipEnvelope { gossip } => {
                return self.on_gossip(&from, gossip, received_at);
            }
            ClusterMessage::Heartbeat { seq } => {
                let response = self.heartbeat_receiver.on_heartbeat(&from, seq);
                self.send_to_node(&from, response);
            }
            ClusterMessage::HeartbeatRsp { seq } => {
                self.heartbeat_sender.on_response(&from, seq, Instant::now());
            }
        }
        Ok(Flow::Continue)
    }

    fn on_join(&mut self, joiner: UniqueAddress, roles: BTreeSet<String>) -> Result<()> {
        if !self.is_member() {
            debug!(joiner = %joiner, "not a member yet, ignoring join request");
            return Ok(());
        }
        if joiner == self.self_node {
            return Ok(());
        }
        if self.latest_gossip.is_tombstoned(&joiner)
            || self
                .latest_gossip
                .reachability()
                .status_from(&self.self_node, &joiner)
                == ReachabilityStatus::Terminated
        {
            warn!(joiner = %joiner, "ignoring join from removed or quarantined incarnation");
            return Ok(());
        }
        if self.latest_gossip.has_member(&joiner) {
            debug!(joiner = %joiner, "existing member joining again, re-sending welcome");
            self.send_welcome(&joiner);
            return Ok(());
        }

        if let Some(previous) = self.latest_gossip.member_by_address(&joiner.address).cloned() {
            // A restarted process: the old incarnation must be removed first
            if previous.status != MemberStatus::Down {
                info!(
                    previous = %previous.unique_address,
                    joiner = %joiner,
                    "new incarnation joining, downing previous incarnation"
                );
                let down = previous.copy(MemberStatus::Down)?;
                MembershipMetrics::increment_downed();
                self.update_latest_gossip(self.latest_gossip.with_member(down))?;
            } else {
                debug!(joiner = %joiner, "previous incarnation not removed yet, ignoring join");
            }
            return Ok(());
        }

        info!(joiner = %joiner, roles = ?roles, "node is joining");
        self.update_latest_gossip(
            self.latest_gossip
                .with_member(Member::new(joiner.clone(), roles)),
        )?;
        MembershipMetrics::increment_joins_accepted();
        self.send_welcome(&joiner);
        Ok(())
    }

    fn send_welcome(&self, joiner: &UniqueAddress) {
        let message = ClusterMessage::Welcome {
            gossip: self.latest_gossip.clone(),
        };
        self.send(joiner.address.clone(), Some(joiner.clone()), message);
    }

    fn on_welcome(&mut self, from: &UniqueAddress, gossip: Gossip) {
        if self.is_member() {
            debug!(from = %from, "already a member, ignoring welcome");
            return;
        }
        if !gossip.has_member(&self.self_node) {
            warn!(from = %from, "welcome does not contain this node, ignoring");
            return;
        }
        info!(node = %self.self_node, seed = %from, "welcomed into cluster");
        self.join = None;
        self.set_latest_gossip(gossip.seen(&self.self_node));
        self.send_envelope(from);
    }

    fn on_gossip(&mut self, from: &UniqueAddress, remote: Gossip, received_at: Instant) -> Result<Flow> {
        let now = Instant::now();
        GossipMetrics::record_queue_delay(now.saturating_duration_since(received_at));

        match self
            .disseminator
            .on_envelope(&self.latest_gossip, from, &remote, received_at, now)
        {
            GossipReceive::Dropped(reason) => {
                debug!(from = %from, reason = ?reason, "dropping gossip");
                GossipMetrics::increment_dropped(drop_label(reason));
                Ok(Flow::Continue)
            }
            GossipReceive::SelfRemoved(gossip) => {
                info!(node = %self.self_node, from = %from, "removed from cluster");
                self.set_latest_gossip(gossip);
                self.on_self_exited();
                Ok(Flow::Stop)
            }
            GossipReceive::Applied {
                gossip,
                kind,
                rejected,
                reply,
            } => {
                GossipMetrics::increment_received(receive_label(kind));
                if rejected.is_empty() {
                    self.set_latest_gossip(gossip);
                } else {
                    for member in &rejected {
                        warn!(
                            from = %from,
                            member = %member,
                            "rejecting gossip entry that moves member backwards"
                        );
                    }
                    GossipMetrics::increment_rejected_entries(rejected.len());
                    self.update_latest_gossip(gossip)?;
                }
                if reply {
                    self.send_envelope(from);
                }
                Ok(Flow::Continue)
            }
        }
    }

    // ==================== Ticks ====================

    fn handle_tick(&mut self, tick: Tick) -> Result<()> {
        match tick {
            Tick::Gossip => {
                self.gossip_round();
                Ok(())
            }
            Tick::Heartbeat => {
                self.heartbeat();
                Ok(())
            }
            Tick::LeaderActions => self.leader_actions(),
            Tick::ReapUnreachable => self.reap_unreachable(),
            Tick::JoinRetry => {
                if !self.is_member() && self.join.is_some() {
                    debug!(node = %self.self_node, "no welcome yet, retrying join");
                    self.send_join();
                }
                Ok(())
            }
        }
    }

    fn gossip_round(&mut self) {
        if !self.is_member() {
            return;
        }
        GossipMetrics::set_converged(self.leader.is_converged(&self.latest_gossip));
        let Some(target) = self.disseminator.select_target(&self.latest_gossip) else {
            return;
        };
        GossipMetrics::increment_rounds();
        trace!(to = %target, "gossip round");
        let status = self.disseminator.status_message(&self.latest_gossip);
        self.send_to_node(&target, status);
    }

    fn heartbeat(&mut self) {
        if !self.is_member() {
            return;
        }
        let probes = self.heartbeat_sender.tick(Instant::now());
        FailureDetectorMetrics::increment_heartbeats_sent(probes.len());
        FailureDetectorMetrics::set_monitored(probes.len());
        for (node, message) in probes {
            self.send_to_node(&node, message);
        }
    }

    fn leader_actions(&mut self) -> Result<()> {
        if !self.is_member() {
            return Ok(());
        }
        MembershipMetrics::set_is_leader(self.leader.is_leader(&self.latest_gossip));

        let Some((gossip, actions)) = self.leader.actions(&self.latest_gossip, now_millis())? else {
            return Ok(());
        };
        for m in &actions.upped {
            info!(node = %m.unique_address, up_number = m.up_number, "leader is moving node to Up");
        }
        for m in &actions.exiting {
            info!(node = %m.unique_address, "leader is moving node to Exiting");
        }
        for m in &actions.removed {
            info!(node = %m.unique_address, "leader is removing node");
        }
        MembershipMetrics::increment_leader_transitions("up", actions.upped.len());
        MembershipMetrics::increment_leader_transitions("exiting", actions.exiting.len());
        MembershipMetrics::increment_leader_transitions("removed", actions.removed.len());

        self.update_latest_gossip(gossip)?;

        // Removed nodes no longer get gossip rounds, tell them once
        for m in &actions.removed {
            if m.unique_address != self.self_node {
                self.send_envelope(&m.unique_address);
            }
        }
        Ok(())
    }

    /// Fold failure detector results into reachability, consult the downing
    /// policy and prune old tombstones
    fn reap_unreachable(&mut self) -> Result<()> {
        if !self.is_member() {
            return Ok(());
        }
        let now = Instant::now();

        let mut reachability = self.latest_gossip.reachability().clone();
        let mut changed = false;
        for member in self.latest_gossip.members() {
            let node = &member.unique_address;
            if node == &self.self_node {
                continue;
            }
            let available = self.heartbeat_sender.is_available(node, now);
            match reachability.status_from(&self.self_node, node) {
                ReachabilityStatus::Reachable if !available => {
                    warn!(node = %node, "marking node as unreachable");
                    FailureDetectorMetrics::increment_marked_unreachable();
                    reachability = reachability.unreachable(&self.self_node, node);
                    changed = true;
                }
                ReachabilityStatus::Unreachable if available => {
                    info!(node = %node, "marking node as reachable again");
                    FailureDetectorMetrics::increment_marked_reachable();
                    reachability = reachability.reachable(&self.self_node, node);
                    changed = true;
                }
                _ => {}
            }
        }
        if changed {
            self.update_latest_gossip(self.latest_gossip.with_reachability(reachability))?;
        }

        self.apply_downing(now)?;

        let retention = self.config.gossip.prune_gossip_tombstones_after.as_millis() as u64;
        let pruned = self
            .latest_gossip
            .prune_tombstones(now_millis().saturating_sub(retention));
        if pruned.tombstones().len() != self.latest_gossip.tombstones().len() {
            debug!("pruned gossip tombstones");
            self.set_latest_gossip(pruned);
        }
        Ok(())
    }

    fn apply_downing(&mut self, now: Instant) -> Result<()> {
        if !self.leader.is_leader(&self.latest_gossip) {
            return Ok(());
        }
        let candidates = self.downing.nodes_to_down(&self.latest_gossip, now);
        if candidates.is_empty() {
            return Ok(());
        }

        let mut gossip = self.latest_gossip.clone();
        for member in self.leader.downable(&self.latest_gossip, &candidates) {
            info!(node = %member.unique_address, "leader is downing unreachable node");
            MembershipMetrics::increment_downed();
            gossip = gossip.with_member(member.copy(MemberStatus::Down)?);
        }
        if gossip != self.latest_gossip {
            self.update_latest_gossip(gossip)?;
        }
        Ok(())
    }

    // ==================== State ====================

    /// Install a locally mutated gossip with a bumped version
    fn update_latest_gossip(&mut self, gossip: Gossip) -> Result<()> {
        let versioned = gossip
            .increment(&self.self_node)
            .only_seen(&self.self_node);
        if !versioned.supersedes(&self.latest_gossip) {
            return Err(ClusterError::VersionNotAdvanced);
        }
        self.set_latest_gossip(versioned);
        Ok(())
    }

    fn set_latest_gossip(&mut self, gossip: Gossip) {
        let old = std::mem::replace(&mut self.latest_gossip, gossip);
        if self.is_member() {
            self.joined = true;
            self.join = None;
        }

        for event in diff(&old, &self.latest_gossip, &self.self_node) {
            info!(node = %self.self_node, event = ?event, "cluster event");
            // No subscribers is fine
            let _ = self.cluster_events.send(event);
        }

        self.heartbeat_sender.update(&self.latest_gossip);
        GossipMetrics::set_member_count(self.latest_gossip.member_count());
        GossipMetrics::set_tombstone_count(self.latest_gossip.tombstones().len());
        FailureDetectorMetrics::set_unreachable(
            self.latest_gossip
                .reachability()
                .all_unreachable_or_terminated()
                .len(),
        );
    }

    /// Whether this node was a member and is now Down or removed
    fn self_exited(&self) -> bool {
        if !self.joined {
            return false;
        }
        match self.latest_gossip.member(&self.self_node) {
            Some(member) => member.status == MemberStatus::Down,
            None => true,
        }
    }

    fn on_self_exited(&mut self) {
        if let Some(member) = self.latest_gossip.member(&self.self_node).cloned() {
            // Downed locally: make sure the others learn about it
            self.push_to_reachable_peers();
            let _ = self.cluster_events.send(ClusterEvent::MemberRemoved {
                member: Member {
                    status: MemberStatus::Removed,
                    ..member.clone()
                },
                previous_status: member.status,
            });
        }
        info!(node = %self.self_node, "this node left the cluster");
    }

    // ==================== Sending ====================

    fn push_to_reachable_peers(&self) {
        let peers: Vec<UniqueAddress> = self
            .latest_gossip
            .members()
            .filter(|m| m.unique_address != self.self_node)
            .filter(|m| {
                self.latest_gossip
                    .reachability()
                    .is_reachable_from(&self.self_node, &m.unique_address)
            })
            .map(|m| m.unique_address.clone())
            .collect();
        for peer in peers {
            self.send_envelope(&peer);
        }
    }

    fn send_envelope(&self, to: &UniqueAddress) {
        let message = self.disseminator.envelope_message(&self.latest_gossip);
        self.send_to_node(to, message);
    }

    fn send_to_node(&self, to: &UniqueAddress, message: ClusterMessage) {
        self.send(to.address.clone(), Some(to.clone()), message);
    }

    /// Fire-and-forget send bounded by the gossip time to live
    fn send(&self, to: Address, target: Option<UniqueAddress>, message: ClusterMessage) {
        let envelope = Envelope::new(self.self_node.clone(), target, message);
        let kind = envelope.message.kind();
        let transport = self.transport.clone();
        let ttl = self.disseminator.time_to_live();
        tokio::spawn(async move {
            match tokio::time::timeout(ttl, transport.send(&to, envelope)).await {
                Ok(Ok(())) => {}
                Ok(Err(ClusterError::MessageTooLarge { size, max })) => {
                    if !OVERSIZE_WARNED.swap(true, Ordering::Relaxed) {
                        warn!(
                            to = %to,
                            kind,
                            size,
                            max,
                            "envelope exceeds the message size limit, cluster state too large to gossip"
                        );
                    }
                    GossipMetrics::increment_send_failures(kind);
                }
                Ok(Err(e)) => {
                    debug!(to = %to, kind, error = %e, "send failed");
                    GossipMetrics::increment_send_failures(kind);
                }
                Err(_) => {
                    debug!(to = %to, kind, "send timed out");
                    GossipMetrics::increment_send_failures(kind);
                }
            }
        });
    }
}

fn drop_label(reason: crate::dissemination::DropReason) -> &'static str {
    use crate::dissemination::DropReason::*;
    match reason {
        Expired => "expired",
        NotMember => "not_member",
        UnknownSender => "unknown_sender",
        QuarantinedSender => "quarantined_sender",
        MissingSelf => "missing_self",
    }
}

fn receive_label(kind: crate::dissemination::ReceiveKind) -> &'static str {
    use crate::dissemination::ReceiveKind::*;
    match kind {
        Older => "older",
        Newer => "newer",
        Same => "same",
        Merged => "merged",
    }
}

/// Cheap, cloneable access to a running coordinator
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    self_node: UniqueAddress,
    commands: mpsc::Sender<CoordinatorEvent>,
    cluster_events: broadcast::Sender<ClusterEvent>,
}

impl ClusterHandle {
    pub fn self_node(&self) -> &UniqueAddress {
        &self.self_node
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(CoordinatorEvent::Command(make(tx)))
            .await
            .map_err(|_| ClusterError::ShuttingDown)?;
        rx.await.map_err(|_| ClusterError::ShuttingDown)
    }

    /// Join the cluster through `seed`; joining one's own address starts a
    /// new cluster. Completion is signalled by a `MemberUp` event.
    pub async fn join(&self, seed: Address) -> Result<()> {
        self.request(|reply| Command::Join { seed, reply }).await?
    }

    /// Join through the first seed; if it is this node, start a new cluster
    pub async fn join_seed_nodes(&self, seeds: Vec<Address>) -> Result<()> {
        self.request(|reply| Command::JoinSeedNodes { seeds, reply })
            .await?
    }

    /// Ask the member at `address` to leave gracefully
    pub async fn leave(&self, address: Address) -> Result<()> {
        self.request(|reply| Command::Leave { address, reply }).await?
    }

    /// Mark the member at `address` as Down
    pub async fn down(&self, address: Address) -> Result<()> {
        self.request(|reply| Command::Down { address, reply }).await?
    }

    pub async fn state(&self) -> Result<CurrentClusterState> {
        self.request(|reply| Command::State { reply }).await
    }

    pub async fn latest_gossip(&self) -> Result<Gossip> {
        self.request(|reply| Command::LatestGossip { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.cluster_events.subscribe()
    }

    /// Leave if Up, push the state to peers and stop the coordinator
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemoryNetwork, InMemoryTransport};
    use crate::vector_clock::VersionOrdering;

    fn config(port: u16) -> ClusterConfig {
        ClusterConfig::builder()
            .system_name("test")
            .host("127.0.0.1")
            .port(port)
            .build()
    }

    fn node(port: u16) -> UniqueAddress {
        UniqueAddress::new(config(port).self_address(), port as u64)
    }

    fn member(n: &UniqueAddress, status: MemberStatus) -> Member {
        Member {
            status,
            ..Member::new(n.clone(), BTreeSet::new())
        }
    }

    /// Coordinator driven by hand, without its event loop
    fn offline(port: u16) -> ClusterCoordinator<InMemoryTransport> {
        let network = InMemoryNetwork::new();
        let config = config(port);
        let (transport, inbound) = network.bind(config.self_address());
        let (coordinator, _handle) =
            ClusterCoordinator::with_identity(config, node(port), transport, inbound).unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_leader_removes_member_with_clock_entry() {
        let mut coordinator = offline(1);
        let (a, b) = (node(1), node(2));
        let before = Gossip::from_members([member(&a, MemberStatus::Up), member(&b, MemberStatus::Exiting)])
            .increment(&a)
            .increment(&b)
            .seen(&a)
            .seen(&b);
        coordinator.set_latest_gossip(before.clone());

        let flow = coordinator
            .handle_event(CoordinatorEvent::Tick(Tick::LeaderActions))
            .unwrap();
        assert!(matches!(flow, Flow::Continue));

        let after = &coordinator.latest_gossip;
        assert!(!after.has_member(&b));
        assert!(after.is_tombstoned(&b));
        assert!(after.supersedes(&before));
        assert_eq!(after.seen_by(), &BTreeSet::from([a]));
    }

    #[tokio::test]
    async fn test_reaper_prunes_old_tombstones_without_new_version() {
        let mut coordinator = offline(1);
        let (a, b) = (node(1), node(2));
        let gossip = Gossip::from_members([member(&a, MemberStatus::Up)])
            .remove(&b, 1)
            .increment(&a)
            .seen(&a);
        coordinator.set_latest_gossip(gossip.clone());

        coordinator
            .handle_event(CoordinatorEvent::Tick(Tick::ReapUnreachable))
            .unwrap();
        let after = &coordinator.latest_gossip;
        assert!(after.tombstones().is_empty());
        assert_eq!(after.version(), gossip.version());
        assert!(after.has_member(&a));
    }

    #[tokio::test]
    async fn test_newer_gossip_with_rejections_keeps_local_tombstones() {
        let mut coordinator = offline(1);
        let (a, b, c, d) = (node(1), node(2), node(3), node(4));
        let base = Gossip::from_members([
            member(&a, MemberStatus::Up),
            member(&b, MemberStatus::Up),
            member(&c, MemberStatus::Exiting),
            member(&d, MemberStatus::Up),
        ])
        .increment(&a)
        .increment(&c);

        // Locally d is Down and c is already removed
        let local = base
            .with_member(member(&d, MemberStatus::Down))
            .remove(&c, 5)
            .increment(&a)
            .only_seen(&a);
        coordinator.set_latest_gossip(local.clone());

        // Newer remote view that still has c and claims d is Up
        let remote = base.increment(&a).increment(&a).increment(&b).seen(&b);
        assert_eq!(remote.compare_version(&local), VersionOrdering::After);

        let flow = coordinator
            .on_gossip(&b, remote.clone(), Instant::now())
            .unwrap();
        assert!(matches!(flow, Flow::Continue));

        let after = &coordinator.latest_gossip;
        assert_eq!(after.member(&d).unwrap().status, MemberStatus::Down);
        assert!(!after.has_member(&c));
        assert!(after.is_tombstoned(&c));
        assert!(after.supersedes(&local));
        assert!(after.supersedes(&remote));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_keeps_running_after_member_leaves() {
        let network = InMemoryNetwork::new();
        let spawn = |port: u16| {
            let config = config(port);
            let (transport, inbound) = network.bind(config.self_address());
            ClusterCoordinator::spawn(config, transport, inbound).unwrap()
        };
        let (a, a_task) = spawn(1);
        let (b, b_task) = spawn(2);
        let seed = config(1).self_address();
        a.join(seed.clone()).await.unwrap();
        b.join(seed).await.unwrap();

        let mut both_up = false;
        for _ in 0..100 {
            let state = a.state().await.unwrap();
            if state.members.len() == 2 && state.members.iter().all(|m| m.status == MemberStatus::Up) {
                both_up = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(both_up);

        let before = a.latest_gossip().await.unwrap();
        b.leave(config(2).self_address()).await.unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(60), b_task).await;
        assert!(matches!(finished, Ok(Ok(Ok(())))));

        let mut removed = false;
        for _ in 0..100 {
            if a.state().await.unwrap().member(&config(2).self_address()).is_none() {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(removed);
        assert!(!a_task.is_finished());
        assert!(a.latest_gossip().await.unwrap().supersedes(&before));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_self_then_up() {
        let network = InMemoryNetwork::new();
        let config = config(1);
        let (transport, inbound) = network.bind(config.self_address());
        let (handle, task) = ClusterCoordinator::spawn(config.clone(), transport, inbound).unwrap();
        let mut events = handle.subscribe();

        handle.join(config.self_address()).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), ClusterEvent::MemberJoined(_)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let state = handle.state().await.unwrap();
        assert_eq!(state.member_status(&config.self_address()), Some(MemberStatus::Up));
        assert_eq!(state.leader, Some(config.self_address()));
        assert_eq!(state.member(&config.self_address()).unwrap().up_number, 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_validate_transitions() {
        let network = InMemoryNetwork::new();
        let config = config(1);
        let (transport, inbound) = network.bind(config.self_address());
        let (handle, _task) = ClusterCoordinator::spawn(config.clone(), transport, inbound).unwrap();

        assert!(matches!(
            handle.join_seed_nodes(vec![]).await,
            Err(ClusterError::NoSeedNodes)
        ));
        let unknown = Address::new("test", "127.0.0.1", 9);
        assert!(matches!(
            handle.leave(unknown).await,
            Err(ClusterError::MemberNotFound(_))
        ));

        handle.join(config.self_address()).await.unwrap();
        // Joining -> Leaving is not a valid edge
        assert!(matches!(
            handle.leave(config.self_address()).await,
            Err(ClusterError::InvalidTransition { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_fails_after_stop() {
        let network = InMemoryNetwork::new();
        let config = config(1);
        let (transport, inbound) = network.bind(config.self_address());
        let (handle, task) = ClusterCoordinator::spawn(config, transport, inbound).unwrap();

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
        assert!(matches!(handle.state().await, Err(ClusterError::ShuttingDown)));
    }

    #[test]
    fn test_identity_must_match_config() {
        let network = InMemoryNetwork::new();
        let config = config(1);
        let (transport, inbound) = network.bind(config.self_address());
        let other = UniqueAddress::new(Address::new("test", "127.0.0.1", 2), 1);
        assert!(matches!(
            ClusterCoordinator::with_identity(config, other, transport, inbound),
            Err(ClusterError::InvalidConfig(_))
        ));
    }
}
