//! Layer configuration
//!
//! One config struct per layer, with defaults matching the protocol
//! constants and `with_*` builders for the handful of knobs tests and
//! scenarios actually turn.

use crate::constants::{DEFAULT_CS_THRESHOLD, DEFAULT_CW_EXPONENT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// PHY bit rate used to convert byte counts into air time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRate(u64);

impl DataRate {
    /// Create a rate from bits per second.
    pub fn from_bps(bps: u64) -> Self {
        DataRate(bps)
    }

    /// Bits per second.
    pub fn bps(&self) -> u64 {
        self.0
    }

    /// Air time of `bytes` at this rate.
    pub fn bytes_tx_time(&self, bytes: u32) -> Duration {
        let micros = (bytes as u64 * 8).saturating_mul(1_000_000) / self.0;
        Duration::from_micros(micros)
    }
}

impl Default for DataRate {
    fn default() -> Self {
        DataRate::from_bps(1_000_000) // 1 Mb/s
    }
}

/// MAC channel-access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacConfig {
    /// Contention-window exponent: backoff slots drawn from [1, 2^cw - 1].
    pub cw_exponent: u16,
    /// Carrier-sense energy threshold, watts.
    pub cs_threshold: f64,
    /// Per-interface queue capacity.
    pub queue_capacity: usize,
    /// PHY data rate for air-time computations.
    pub data_rate: DataRate,
    /// Channel used before any cluster assignment, so the control plane
    /// can bootstrap. `None` keeps the interface silent until assigned.
    pub control_channel: Option<u16>,
    /// Seed for backoff/jitter draws.
    pub seed: u64,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            cw_exponent: DEFAULT_CW_EXPONENT,
            cs_threshold: DEFAULT_CS_THRESHOLD,
            queue_capacity: 64,
            data_rate: DataRate::default(),
            control_channel: Some(0),
            seed: 1,
        }
    }
}

impl MacConfig {
    pub fn with_cs_threshold(mut self, threshold: f64) -> Self {
        self.cs_threshold = threshold;
        self
    }

    pub fn with_control_channel(mut self, channel: Option<u16>) -> Self {
        self.control_channel = channel;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Cluster-formation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Period between NCCI advertisements.
    pub advertise_period: Duration,
    /// Period between neighbor-table rebuilds.
    pub table_update_period: Duration,
    /// Period between cluster-head candidate selections.
    pub candidacy_period: Duration,
    /// Age of a cluster: head status is re-evaluated every interval.
    pub cluster_age: Duration,
    /// Lifetime of a cached control message.
    pub ctrl_msg_lifetime: Duration,
    /// Period between requested spectrum-sensing windows.
    pub sensing_period: Duration,
    /// Energy weight in the fitness score.
    pub beta1: f64,
    /// Channel-fitness weight.
    pub beta2: f64,
    /// Neighboring-cluster weight.
    pub beta3: f64,
    /// Neighbor-count weight.
    pub beta4: f64,
    /// Fraction of neighbors whose CH_REQs make this node a head.
    pub eta: f64,
    /// Normalization maxima for the fitness terms.
    pub energy_max: f64,
    pub channel_fitness_max: f64,
    pub neighbor_clusters_max: u16,
    pub neighbors_max: u16,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            advertise_period: Duration::from_millis(100),
            table_update_period: Duration::from_millis(250),
            candidacy_period: Duration::from_millis(500),
            cluster_age: Duration::from_secs(1),
            // Must outlive the cluster age, or head announcements expire
            // between evaluations and members can never adopt a head.
            ctrl_msg_lifetime: Duration::from_millis(1_500),
            sensing_period: Duration::from_secs(1),
            beta1: 0.4,
            beta2: 0.3,
            beta3: 0.15,
            beta4: 0.15,
            eta: 0.5,
            energy_max: 100.0,
            channel_fitness_max: 16.0,
            neighbor_clusters_max: 8,
            neighbors_max: 32,
        }
    }
}

impl ClusterConfig {
    pub fn with_eta(mut self, eta: f64) -> Self {
        self.eta = eta;
        self
    }

    pub fn with_betas(mut self, b1: f64, b2: f64, b3: f64, b4: f64) -> Self {
        self.beta1 = b1;
        self.beta2 = b2;
        self.beta3 = b3;
        self.beta4 = b4;
        self
    }

    pub fn with_ctrl_msg_lifetime(mut self, lifetime: Duration) -> Self {
        self.ctrl_msg_lifetime = lifetime;
        self
    }
}

/// Reactive-routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Lifetime of a routing-table entry without a refreshing reply.
    pub route_ttl: Duration,
    /// Expiry window of an outstanding (originator, target) discovery.
    pub pending_ttl: Duration,
    /// Byte count used for the one-hop link-delay estimate.
    pub nominal_frame_bytes: u32,
    /// Capacity of the pending-packet buffer.
    pub buffer_capacity: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            route_ttl: Duration::from_secs(600),
            pending_ttl: Duration::from_secs(2),
            nominal_frame_bytes: 512,
            buffer_capacity: 128,
        }
    }
}

impl RoutingConfig {
    pub fn with_route_ttl(mut self, ttl: Duration) -> Self {
        self.route_ttl = ttl;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_rate_air_time() {
        let rate = DataRate::from_bps(1_000_000);
        // 125 bytes = 1000 bits = 1 ms at 1 Mb/s.
        assert_eq!(rate.bytes_tx_time(125), Duration::from_millis(1));
    }

    #[test]
    fn test_defaults_sane() {
        let mac = MacConfig::default();
        assert!(mac.cs_threshold > 0.0);
        assert!(mac.queue_capacity > 0);

        let cluster = ClusterConfig::default();
        let beta_sum = cluster.beta1 + cluster.beta2 + cluster.beta3 + cluster.beta4;
        assert!((beta_sum - 1.0).abs() < 1e-9);
        assert!(cluster.eta > 0.0 && cluster.eta <= 1.0);
        assert!(cluster.ctrl_msg_lifetime > cluster.advertise_period);
        // Announcements must survive a whole head-evaluation cycle.
        assert!(cluster.ctrl_msg_lifetime > cluster.cluster_age);
    }
}
