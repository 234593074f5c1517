//! Phi accrual failure detection
//!
//! Instead of a boolean timeout the detector computes a suspicion level
//! `phi = -log10(1 - F(elapsed))` where `F` is the cumulative normal
//! distribution fitted to recent heartbeat inter-arrival times. A peer is
//! available while `phi` stays below the configured threshold.
//!
//! Hysteresis comes from two knobs: `min_std_deviation` keeps a very regular
//! heartbeat stream from making the detector hair-triggered, and
//! `acceptable_heartbeat_pause` shifts the expected mean so that a single
//! missed heartbeat is not fatal. A hard `heartbeat_timeout` marks the peer
//! unavailable regardless of statistics.
//!
//! Reference: Hayashibara et al., "The φ Accrual Failure Detector" (2004)

use crate::config::FailureDetectorConfig;
use crate::node::UniqueAddress;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Sliding window of inter-arrival intervals in milliseconds
#[derive(Debug, Clone)]
struct HeartbeatHistory {
    max_sample_size: usize,
    intervals: VecDeque<f64>,
    sum: f64,
    squared_sum: f64,
}

impl HeartbeatHistory {
    fn new(max_sample_size: usize) -> Self {
        Self {
            max_sample_size: max_sample_size.max(1),
            intervals: VecDeque::new(),
            sum: 0.0,
            squared_sum: 0.0,
        }
    }

    fn push(&mut self, interval: f64) {
        if self.intervals.len() >= self.max_sample_size {
            if let Some(oldest) = self.intervals.pop_front() {
                self.sum -= oldest;
                self.squared_sum -= oldest * oldest;
            }
        }
        self.intervals.push_back(interval);
        self.sum += interval;
        self.squared_sum += interval * interval;
    }

    fn mean(&self) -> f64 {
        if self.intervals.is_empty() {
            0.0
        } else {
            self.sum / self.intervals.len() as f64
        }
    }

    fn variance(&self) -> f64 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        (self.squared_sum / self.intervals.len() as f64 - mean * mean).max(0.0)
    }

    fn std_deviation(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Failure detector for a single peer
#[derive(Debug, Clone)]
pub struct PhiAccrualFailureDetector {
    threshold: f64,
    min_std_deviation: Duration,
    acceptable_heartbeat_pause: Duration,
    first_heartbeat_estimate: Duration,
    heartbeat_timeout: Duration,
    history: HeartbeatHistory,
    last_heartbeat: Option<Instant>,
}

impl PhiAccrualFailureDetector {
    pub fn new(config: &FailureDetectorConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_std_deviation: config.min_std_deviation,
            acceptable_heartbeat_pause: config.acceptable_heartbeat_pause,
            first_heartbeat_estimate: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            history: HeartbeatHistory::new(config.max_sample_size),
            last_heartbeat: None,
        }
    }

    /// Whether at least one heartbeat has been recorded
    pub fn is_monitoring(&self) -> bool {
        self.last_heartbeat.is_some()
    }

    pub fn heartbeat(&mut self) {
        self.heartbeat_at(Instant::now());
    }

    /// Record a heartbeat arriving at `now`
    pub fn heartbeat_at(&mut self, now: Instant) {
        match self.last_heartbeat {
            None => {
                // Seed the history with the expected interval so the first
                // few heartbeats do not produce extreme phi values
                let mean = self.first_heartbeat_estimate.as_secs_f64() * 1000.0;
                let std_deviation = mean / 4.0;
                self.history.push(mean - std_deviation);
                self.history.push(mean + std_deviation);
            }
            Some(last) => {
                // The first heartbeat after a failure would skew the stats
                if self.is_available_at(now) {
                    let interval = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
                    self.history.push(interval);
                }
            }
        }
        self.last_heartbeat = Some(now);
    }

    pub fn phi(&self) -> f64 {
        self.phi_at(Instant::now())
    }

    /// Suspicion level at `now`, zero before the first heartbeat
    pub fn phi_at(&self, now: Instant) -> f64 {
        let Some(last) = self.last_heartbeat else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
        let mean = self.history.mean() + self.acceptable_heartbeat_pause.as_secs_f64() * 1000.0;
        let std_deviation = self
            .history
            .std_deviation()
            .max(self.min_std_deviation.as_secs_f64() * 1000.0);
        phi(elapsed, mean, std_deviation)
    }

    pub fn is_available(&self) -> bool {
        self.is_available_at(Instant::now())
    }

    pub fn is_available_at(&self, now: Instant) -> bool {
        let Some(last) = self.last_heartbeat else {
            return true;
        };
        if now.saturating_duration_since(last) > self.heartbeat_timeout {
            return false;
        }
        self.phi_at(now) < self.threshold
    }
}

/// Logistic approximation of the cumulative normal distribution, as used by
/// the Cassandra and Akka implementations
fn phi(elapsed: f64, mean: f64, std_deviation: f64) -> f64 {
    let y = (elapsed - mean) / std_deviation;
    let e = (-y * (1.5976 + 0.070566 * y * y)).exp();
    if elapsed > mean {
        -(e / (1.0 + e)).log10()
    } else {
        -(1.0 - 1.0 / (1.0 + e)).log10()
    }
}

/// Failure detectors for every monitored peer
#[derive(Debug)]
pub struct FailureDetectorRegistry {
    config: FailureDetectorConfig,
    detectors: HashMap<UniqueAddress, PhiAccrualFailureDetector>,
}

impl FailureDetectorRegistry {
    pub fn new(config: FailureDetectorConfig) -> Self {
        Self {
            config,
            detectors: HashMap::new(),
        }
    }

    pub fn heartbeat(&mut self, node: &UniqueAddress, now: Instant) {
        let config = &self.config;
        self.detectors
            .entry(node.clone())
            .or_insert_with(|| PhiAccrualFailureDetector::new(config))
            .heartbeat_at(now);
    }

    /// Unknown peers count as available
    pub fn is_available(&self, node: &UniqueAddress, now: Instant) -> bool {
        self.detectors
            .get(node)
            .map(|d| d.is_available_at(now))
            .unwrap_or(true)
    }

    pub fn is_monitoring(&self, node: &UniqueAddress) -> bool {
        self.detectors
            .get(node)
            .map(|d| d.is_monitoring())
            .unwrap_or(false)
    }

    pub fn phi(&self, node: &UniqueAddress, now: Instant) -> f64 {
        self.detectors.get(node).map(|d| d.phi_at(now)).unwrap_or(0.0)
    }

    pub fn remove(&mut self, node: &UniqueAddress) {
        self.detectors.remove(node);
    }

    pub fn reset(&mut self) {
        self.detectors.clear();
    }

    pub fn monitored(&self) -> impl Iterator<Item = &UniqueAddress> {
        self.detectors.keys()
    }
}
