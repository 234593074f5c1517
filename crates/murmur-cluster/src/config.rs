//! Cluster configuration
//!
//! Defaults follow the reference cluster implementation. The values trade
//! detection latency against false positives and should be tuned per
//! deployment rather than hard-coded.

use crate::error::{ClusterError, Result};
use crate::node::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Actor-system style name shared by all nodes of one cluster
    pub system_name: String,

    /// Host other nodes use to reach this node
    pub host: String,

    /// Port other nodes use to reach this node
    pub port: u16,

    /// Roles advertised by this node
    pub roles: BTreeSet<String>,

    /// Seed nodes tried in order when joining
    pub seed_nodes: Vec<Address>,

    /// Gossip dissemination configuration
    pub gossip: GossipConfig,

    /// Failure detector and heartbeat configuration
    pub failure_detector: FailureDetectorConfig,

    /// Leader action configuration
    pub leader: LeaderConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            system_name: "murmur".to_string(),
            host: "127.0.0.1".to_string(),
            port: 2552,
            roles: BTreeSet::new(),
            seed_nodes: vec![],
            gossip: GossipConfig::default(),
            failure_detector: FailureDetectorConfig::default(),
            leader: LeaderConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Create configuration builder
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::new()
    }

    /// Address this node advertises
    pub fn self_address(&self) -> Address {
        Address::new(&self.system_name, &self.host, self.port)
    }

    /// Reject values that would break the protocol's timing assumptions
    pub fn validate(&self) -> Result<()> {
        if self.system_name.is_empty() {
            return Err(ClusterError::InvalidConfig("system_name must not be empty".into()));
        }
        if self.gossip.gossip_interval.is_zero() {
            return Err(ClusterError::InvalidConfig("gossip_interval must be > 0".into()));
        }
        if self.gossip.retry_unsuccessful_join_after.is_zero() {
            return Err(ClusterError::InvalidConfig(
                "retry_unsuccessful_join_after must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.gossip.different_view_probability) {
            return Err(ClusterError::InvalidConfig(
                "different_view_probability must be within [0, 1]".into(),
            ));
        }
        if self.failure_detector.heartbeat_interval.is_zero() {
            return Err(ClusterError::InvalidConfig("heartbeat_interval must be > 0".into()));
        }
        if self.failure_detector.threshold <= 0.0 {
            return Err(ClusterError::InvalidConfig("failure detector threshold must be > 0".into()));
        }
        if self.failure_detector.max_sample_size == 0 {
            return Err(ClusterError::InvalidConfig("max_sample_size must be > 0".into()));
        }
        if self.failure_detector.monitored_by_nr_of_members == 0 {
            return Err(ClusterError::InvalidConfig(
                "monitored_by_nr_of_members must be > 0".into(),
            ));
        }
        if self.failure_detector.heartbeat_timeout <= self.failure_detector.heartbeat_interval {
            return Err(ClusterError::InvalidConfig(
                "heartbeat_timeout must exceed heartbeat_interval".into(),
            ));
        }
        if self.leader.leader_actions_interval.is_zero()
            || self.leader.unreachable_nodes_reaper_interval.is_zero()
        {
            return Err(ClusterError::InvalidConfig("leader intervals must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for cluster configuration
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    system_name: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    roles: BTreeSet<String>,
    seed_nodes: Vec<Address>,
    gossip: Option<GossipConfig>,
    failure_detector: Option<FailureDetectorConfig>,
    leader: Option<LeaderConfig>,
}

impl ClusterConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn system_name(mut self, name: impl Into<String>) -> Self {
        self.system_name = Some(name.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn seed_nodes(mut self, seeds: Vec<Address>) -> Self {
        self.seed_nodes = seeds;
        self
    }

    pub fn gossip(mut self, config: GossipConfig) -> Self {
        self.gossip = Some(config);
        self
    }

    pub fn failure_detector(mut self, config: FailureDetectorConfig) -> Self {
        self.failure_detector = Some(config);
        self
    }

    pub fn leader(mut self, config: LeaderConfig) -> Self {
        self.leader = Some(config);
        self
    }

    pub fn build(self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            system_name: self.system_name.unwrap_or(defaults.system_name),
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            roles: self.roles,
            seed_nodes: self.seed_nodes,
            gossip: self.gossip.unwrap_or_default(),
            failure_detector: self.failure_detector.unwrap_or_default(),
            leader: self.leader.unwrap_or_default(),
        }
    }
}

/// Gossip dissemination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Interval between gossip rounds
    pub gossip_interval: Duration,

    /// Inbound gossip older than this is discarded, and sends are abandoned
    /// after this long
    pub gossip_time_to_live: Duration,

    /// Probability of picking a peer with a different view of the gossip
    pub different_view_probability: f64,

    /// Cluster size above which `different_view_probability` is reduced
    pub reduce_gossip_different_view_probability: usize,

    /// Delay before the first periodic task fires
    pub periodic_tasks_initial_delay: Duration,

    /// Interval between Join retries while no Welcome has arrived
    pub retry_unsuccessful_join_after: Duration,

    /// How long tombstones of removed members are kept
    pub prune_gossip_tombstones_after: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(1),
            gossip_time_to_live: Duration::from_secs(2),
            different_view_probability: 0.8,
            reduce_gossip_different_view_probability: 400,
            periodic_tasks_initial_delay: Duration::from_secs(1),
            retry_unsuccessful_join_after: Duration::from_secs(10),
            prune_gossip_tombstones_after: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Failure detector and heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetectorConfig {
    /// Interval between heartbeats to each monitored peer
    pub heartbeat_interval: Duration,

    /// Phi value above which a peer is considered unreachable
    pub threshold: f64,

    /// Number of inter-arrival samples kept per peer
    pub max_sample_size: usize,

    /// Lower bound for the standard deviation used in the phi calculation
    pub min_std_deviation: Duration,

    /// Pause that is tolerated on top of the mean interval
    pub acceptable_heartbeat_pause: Duration,

    /// No heartbeat for this long marks a peer unreachable unconditionally
    pub heartbeat_timeout: Duration,

    /// Number of peers that monitor each node
    pub monitored_by_nr_of_members: usize,

    /// Time after which a newly monitored peer that never answered starts
    /// counting as a heartbeat-less peer
    pub expected_response_after: Duration,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            threshold: 8.0,
            max_sample_size: 1000,
            min_std_deviation: Duration::from_millis(100),
            acceptable_heartbeat_pause: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(10),
            monitored_by_nr_of_members: 9,
            expected_response_after: Duration::from_secs(1),
        }
    }
}

/// Leader action configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    /// Interval between convergence checks by the leader
    pub leader_actions_interval: Duration,

    /// Interval at which failure detector results are folded into reachability
    pub unreachable_nodes_reaper_interval: Duration,

    /// Down members that stay unreachable this long (None = never)
    pub auto_down_unreachable_after: Option<Duration>,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            leader_actions_interval: Duration::from_secs(1),
            unreachable_nodes_reaper_interval: Duration::from_secs(1),
            auto_down_unreachable_after: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClusterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.gossip.gossip_interval, Duration::from_secs(1));
        assert_eq!(config.failure_detector.threshold, 8.0);
        assert!(config.leader.auto_down_unreachable_after.is_none());
    }

    #[test]
    fn test_builder() {
        let seed = Address::new("orders", "10.0.0.1", 2552);
        let config = ClusterConfig::builder()
            .system_name("orders")
            .host("10.0.0.2")
            .port(2553)
            .role("backend")
            .seed_nodes(vec![seed.clone()])
            .build();

        assert_eq!(config.self_address(), Address::new("orders", "10.0.0.2", 2553));
        assert!(config.roles.contains("backend"));
        assert_eq!(config.seed_nodes, vec![seed]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ClusterConfig::default();
        config.gossip.different_view_probability = 1.5;
        assert!(matches!(config.validate(), Err(ClusterError::InvalidConfig(_))));

        let mut config = ClusterConfig::default();
        config.failure_detector.heartbeat_timeout = Duration::from_millis(500);
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.gossip.gossip_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
