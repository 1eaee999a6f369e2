//! Per-run shared state
//!
//! One [`NetContext`] exists per simulation run and is threaded through the
//! layers explicitly: packet-id allocation, the control-message registry
//! the receive path resolves payloads against, and the run-wide counters.
//! Keeping this per-run (instead of process-wide) lets independent runs and
//! tests coexist in one process.

use crate::frame::PacketId;
use crate::message::ControlMessage;
use crate::table::TtlMap;
use crate::time::Timestamp;
use serde::Serialize;
use std::time::Duration;

/// Run-wide traffic counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Counters {
    /// Data packets handed to a routing unit by the application layer.
    pub packets_injected: u64,
    /// Data packets that reached their final destination.
    pub packets_delivered: u64,
    /// Summed end-to-end latency of delivered packets, seconds.
    pub total_latency_secs: f64,
    /// Bytes put on the air by the cluster control plane.
    pub control_bytes: u64,
    /// Bytes put on the air by the routing plane.
    pub routing_bytes: u64,
    /// Frames dropped because an interface queue was full.
    pub queue_drops: u64,
    /// Transmissions the PHY refused to start.
    pub phy_refusals: u64,
}

impl Counters {
    /// Mean end-to-end latency of delivered packets, seconds.
    pub fn mean_latency_secs(&self) -> f64 {
        if self.packets_delivered == 0 {
            0.0
        } else {
            self.total_latency_secs / self.packets_delivered as f64
        }
    }

    /// Fraction of injected packets delivered.
    pub fn delivery_ratio(&self) -> f64 {
        if self.packets_injected == 0 {
            0.0
        } else {
            self.packets_delivered as f64 / self.packets_injected as f64
        }
    }
}

/// Shared per-run state.
pub struct NetContext {
    next_packet_id: u64,
    /// Control messages in flight, looked up by the carrying packet's id on
    /// the receive path. Entries expire with the control-message lifetime.
    registry: TtlMap<PacketId, ControlMessage>,
    /// Run-wide counters.
    pub counters: Counters,
}

impl NetContext {
    /// Create a context whose registry entries live for `ctrl_msg_lifetime`.
    pub fn new(ctrl_msg_lifetime: Duration) -> Self {
        Self {
            next_packet_id: 1,
            registry: TtlMap::new(ctrl_msg_lifetime),
            counters: Counters::default(),
        }
    }

    /// Allocate a run-unique packet id.
    pub fn next_packet_id(&mut self) -> PacketId {
        let id = PacketId(self.next_packet_id);
        self.next_packet_id += 1;
        id
    }

    /// Register a control message for the receive path.
    pub fn register_message(&mut self, msg: ControlMessage, now: Timestamp) {
        self.registry.insert(msg.packet_id(), msg, now);
    }

    /// Resolve a received packet id to its control message.
    pub fn lookup_message(&self, id: PacketId, now: Timestamp) -> Option<&ControlMessage> {
        self.registry.get(&id, now)
    }

    /// Drop expired registry entries.
    pub fn purge(&mut self, now: Timestamp) {
        self.registry.purge_expired(now);
    }
}
