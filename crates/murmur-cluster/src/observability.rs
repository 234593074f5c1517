//! Metrics for the membership engine
//!
//! Lightweight, Rust-native metrics using the `metrics` crate with Prometheus
//! export support.
//!
//! # Feature Flags
//!
//! ```toml
//! # Cargo.toml
//! murmur-cluster = { version = "0.1", features = ["metrics-prometheus"] }
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use murmur_cluster::observability::{init_metrics, GossipMetrics};
//!
//! init_metrics(None)?;
//!
//! // Record metrics (zero-cost if feature disabled)
//! GossipMetrics::increment_rounds();
//! GossipMetrics::set_member_count(5);
//! ```

#![cfg_attr(not(feature = "metrics-prometheus"), allow(unused_variables))]

use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Gossip Metrics
// ============================================================================

/// Gossip exchange metrics
pub struct GossipMetrics;

impl GossipMetrics {
    // ---- Counters ----

    /// Gossip rounds started by this node
    pub fn increment_rounds() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("murmur_gossip_rounds_total").increment(1);
    }

    /// Gossip received, labelled by how it related to the local version
    pub fn increment_received(kind: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("murmur_gossip_received_total", "kind" => kind).increment(1);
    }

    /// Envelopes discarded before merging
    pub fn increment_dropped(reason: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("murmur_gossip_dropped_total", "reason" => reason).increment(1);
    }

    /// Remote member entries refused because they moved a member backwards
    pub fn increment_rejected_entries(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("murmur_gossip_rejected_entries_total").increment(count as u64);
    }

    /// Outbound messages that failed or timed out
    pub fn increment_send_failures(kind: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("murmur_gossip_send_failures_total", "kind" => kind).increment(1);
    }

    // ---- Gauges ----

    /// Number of members in the local gossip
    pub fn set_member_count(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("murmur_gossip_member_count").set(count as f64);
    }

    /// Number of tombstones carried by the local gossip
    pub fn set_tombstone_count(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("murmur_gossip_tombstone_count").set(count as f64);
    }

    /// Whether the local gossip has converged (1 = yes, 0 = no)
    pub fn set_converged(converged: bool) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("murmur_gossip_converged").set(if converged { 1.0 } else { 0.0 });
    }

    // ---- Histograms ----

    /// Time an inbound envelope spent queued before it was processed
    pub fn record_queue_delay(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("murmur_gossip_queue_delay_seconds").record(duration.as_secs_f64());
    }
}

// ============================================================================
// Membership Metrics
// ============================================================================

/// Membership transition metrics
pub struct MembershipMetrics;

impl MembershipMetrics {
    /// Status transitions applied by the leader, labelled by target status
    pub fn increment_leader_transitions(to: &'static str, count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("murmur_membership_leader_transitions_total", "to" => to)
            .increment(count as u64);
    }

    /// Join requests accepted by this node
    pub fn increment_joins_accepted() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("murmur_membership_joins_accepted_total").increment(1);
    }

    /// Members downed by the downing policy or an operator
    pub fn increment_downed() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("murmur_membership_downed_total").increment(1);
    }

    /// Whether this node is the leader (1 = yes, 0 = no)
    pub fn set_is_leader(is_leader: bool) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("murmur_membership_is_leader").set(if is_leader { 1.0 } else { 0.0 });
    }
}

// ============================================================================
// Failure Detector Metrics
// ============================================================================

/// Heartbeat and reachability metrics
pub struct FailureDetectorMetrics;

impl FailureDetectorMetrics {
    /// Heartbeats sent
    pub fn increment_heartbeats_sent(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("murmur_fd_heartbeats_sent_total").increment(count as u64);
    }

    /// Peers newly marked unreachable by this node
    pub fn increment_marked_unreachable() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("murmur_fd_marked_unreachable_total").increment(1);
    }

    /// Peers marked reachable again by this node
    pub fn increment_marked_reachable() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("murmur_fd_marked_reachable_total").increment(1);
    }

    /// Peers currently monitored by this node
    pub fn set_monitored(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("murmur_fd_monitored_peers").set(count as f64);
    }

    /// Members considered unreachable in the local gossip
    pub fn set_unreachable(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("murmur_fd_unreachable_members").set(count as f64);
    }
}

// ============================================================================
// Prometheus Backend (when enabled)
// ============================================================================

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Start an HTTP listener serving `/metrics`
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new().with_http_listener(addr).install()?;

        tracing::info!("Prometheus metrics exporter listening on http://{}/metrics", addr);
        Ok(())
    }

    /// Install the recorder only, for embedding in an existing server
    pub fn init_prometheus_recorder() -> Result<
        metrics_exporter_prometheus::PrometheusHandle,
        Box<dyn std::error::Error + Send + Sync>,
    > {
        let handle = PrometheusBuilder::new().install_recorder()?;
        Ok(handle)
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::{init_prometheus_exporter, init_prometheus_recorder};

// ============================================================================
// Unified Initialization
// ============================================================================

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize metrics subsystem
///
/// Call this once at application startup. Safe to call multiple times.
pub fn init_metrics(
    prometheus_addr: Option<std::net::SocketAddr>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    METRICS_INITIALIZED.get_or_init(|| {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(addr) = prometheus_addr {
            if let Err(e) = init_prometheus_exporter(addr) {
                tracing::error!("Failed to start Prometheus exporter: {}", e);
            }
        }

        tracing::info!(
            prometheus = cfg!(feature = "metrics-prometheus"),
            "Metrics subsystem initialized"
        );
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gossip_metrics_compile() {
        GossipMetrics::increment_rounds();
        GossipMetrics::increment_received("newer");
        GossipMetrics::increment_dropped("expired");
        GossipMetrics::set_member_count(3);
        GossipMetrics::record_queue_delay(Duration::from_millis(3));
    }

    #[test]
    fn test_membership_metrics_compile() {
        MembershipMetrics::increment_leader_transitions("up", 2);
        MembershipMetrics::increment_joins_accepted();
        MembershipMetrics::set_is_leader(true);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_metrics(None).unwrap();
        init_metrics(None).unwrap();
        FailureDetectorMetrics::set_monitored(4);
    }
}
