//! Node wiring
//!
//! A [`MeshNode`] composes one MAC interface, one routing unit, and one
//! cluster coordinator, and owns the node's PHY, energy model, and spectrum
//! estimator. All cross-layer calls pass the collaborators explicitly, so a
//! node that compiles is a node that is fully wired.

use crate::cluster::{ClusterCoordinator, ClusterRole};
use crate::config::{ClusterConfig, MacConfig, RoutingConfig};
use crate::context::NetContext;
use crate::event::Event;
use crate::frame::{LinkFrame, NodeId};
use crate::mac::MacChannelAccess;
use crate::routing::{Delivery, RoutingUnit};
use crate::scheduler::Scheduler;
use crate::time::Timestamp;
use crate::traits::{EnergyMonitor, Phy, SpectrumEstimator};
use crate::wire;
use tracing::warn;

/// Energy model with constant drain per radio state.
///
/// Enough accounting to drive the cluster layer's energy term: a fixed
/// budget drained at `tx_watts` while transmitting and `rx_watts` while
/// receiving.
#[derive(Debug, Clone)]
pub struct LinearEnergyModel {
    remaining: f64,
    tx_watts: f64,
    rx_watts: f64,
    tx_since: Option<Timestamp>,
    rx_since: Option<Timestamp>,
}

impl LinearEnergyModel {
    /// Create a model with `initial` joules.
    pub fn new(initial: f64, tx_watts: f64, rx_watts: f64) -> Self {
        Self {
            remaining: initial,
            tx_watts,
            rx_watts,
            tx_since: None,
            rx_since: None,
        }
    }

    fn drain(&mut self, watts: f64, since: Timestamp, now: Timestamp) {
        let joules = watts * now.duration_since(since).as_secs_f64();
        self.remaining = (self.remaining - joules).max(0.0);
    }
}

impl Default for LinearEnergyModel {
    fn default() -> Self {
        Self::new(100.0, 0.5, 0.2)
    }
}

impl EnergyMonitor for LinearEnergyModel {
    fn remaining_energy(&self) -> f64 {
        self.remaining
    }

    fn on_tx_start(&mut self, now: Timestamp) {
        self.tx_since = Some(now);
    }

    fn on_tx_end(&mut self, now: Timestamp) {
        if let Some(since) = self.tx_since.take() {
            self.drain(self.tx_watts, since, now);
        }
    }

    fn on_rx_start(&mut self, now: Timestamp) {
        self.rx_since = Some(now);
    }

    fn on_rx_end(&mut self, now: Timestamp) {
        if let Some(since) = self.rx_since.take() {
            self.drain(self.rx_watts, since, now);
        }
    }
}

/// One node of the cognitive mesh: MAC + routing + clustering plus the
/// node's collaborators.
pub struct MeshNode<P: Phy, E: EnergyMonitor, S: SpectrumEstimator> {
    pub mac: MacChannelAccess,
    pub routing: RoutingUnit,
    pub coordinator: ClusterCoordinator,
    pub phy: P,
    pub energy: E,
    pub estimator: S,
    /// Payloads that reached this node as final destination.
    received: Vec<LinkFrame>,
}

impl<P: Phy, E: EnergyMonitor, S: SpectrumEstimator> MeshNode<P, E, S> {
    /// Assemble a node from its parts.
    pub fn new(
        address: NodeId,
        mac_config: MacConfig,
        cluster_config: ClusterConfig,
        routing_config: RoutingConfig,
        phy: P,
        energy: E,
        estimator: S,
    ) -> Self {
        let data_rate = mac_config.data_rate;
        Self {
            mac: MacChannelAccess::new(address, mac_config),
            routing: RoutingUnit::new(address, routing_config, data_rate),
            coordinator: ClusterCoordinator::new(address, cluster_config),
            phy,
            energy,
            estimator,
            received: Vec::new(),
        }
    }

    /// This node's address.
    pub fn address(&self) -> NodeId {
        self.mac.address()
    }

    /// Arm the periodic cluster timers.
    pub fn start(&mut self, sched: &mut Scheduler) {
        self.coordinator.start(sched);
    }

    /// The node's current cluster role.
    pub fn role(&self, sched: &Scheduler) -> ClusterRole {
        self.coordinator.role(sched)
    }

    /// Payloads delivered to this node as final destination.
    pub fn received(&self) -> &[LinkFrame] {
        &self.received
    }

    /// Hand an application payload to the routing unit.
    pub fn send(
        &mut self,
        dest: NodeId,
        protocol: u16,
        payload: Vec<u8>,
        sched: &mut Scheduler,
        ctx: &mut NetContext,
    ) {
        let source = self.address();
        self.routing.send_packet(
            payload,
            source,
            dest,
            protocol,
            &mut self.mac,
            &mut self.phy,
            sched,
            ctx,
        );
    }

    /// Dispatch one scheduled event addressed to this node.
    pub fn handle_event(&mut self, event: Event, sched: &mut Scheduler, ctx: &mut NetContext) {
        match event {
            Event::Mac { step, .. } => {
                self.mac
                    .handle_step(step, &mut self.phy, &mut self.energy, sched, ctx);
            }
            Event::Cluster { tick, .. } => {
                self.coordinator.handle_tick(
                    tick,
                    &mut self.routing,
                    &mut self.mac,
                    &mut self.phy,
                    &mut self.energy,
                    &self.estimator,
                    sched,
                    ctx,
                );
            }
            Event::RxStart { .. } => {
                self.mac.on_rx_start(&mut self.energy, sched);
            }
            Event::RxEnd { frame, error, .. } => {
                if error {
                    self.mac.on_rx_end_error(&mut self.energy, sched);
                } else if let Some(up) = self.mac.on_rx_end_ok(frame, &mut self.energy, sched) {
                    self.deliver_upward(up, sched, ctx);
                }
            }
            Event::TxEnd { frame, .. } => {
                self.mac.on_tx_end(&frame, &mut self.energy, sched);
            }
            Event::AppSend {
                dest,
                protocol,
                payload,
                ..
            } => {
                self.send(dest, protocol, payload, sched, ctx);
            }
            Event::QualityUpdate { qualities, .. } => {
                self.coordinator.on_quality_update(&qualities);
            }
        }
    }

    /// Route a frame the MAC handed upward: to the application, the
    /// cluster coordinator, or back onto the air.
    fn deliver_upward(&mut self, frame: LinkFrame, sched: &mut Scheduler, ctx: &mut NetContext) {
        match self.routing.receive_frame(
            frame,
            &mut self.mac,
            &mut self.phy,
            sched,
            ctx,
        ) {
            Delivery::Local(delivered) => self.received.push(delivered),
            Delivery::Control(carrier) => {
                // The registry is authoritative; fall back to decoding the
                // payload when the entry already expired.
                let msg = ctx
                    .lookup_message(carrier.packet_id(), sched.now())
                    .cloned()
                    .or_else(|| wire::decode_message(carrier.payload()).ok());
                match msg {
                    Some(msg) => {
                        self.coordinator
                            .on_control_message(msg, &mut self.routing, sched);
                    }
                    None => {
                        warn!(node = %self.address(), id = %carrier.packet_id(),
                              "control payload unresolvable, dropping");
                    }
                }
            }
            Delivery::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_drains_by_state() {
        let mut model = LinearEnergyModel::new(10.0, 2.0, 1.0);
        model.on_tx_start(Timestamp::ZERO);
        model.on_tx_end(Timestamp::from_secs(1));
        assert!((model.remaining_energy() - 8.0).abs() < 1e-9);

        model.on_rx_start(Timestamp::from_secs(1));
        model.on_rx_end(Timestamp::from_secs(3));
        assert!((model.remaining_energy() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_energy_never_negative() {
        let mut model = LinearEnergyModel::new(0.5, 2.0, 1.0);
        model.on_tx_start(Timestamp::ZERO);
        model.on_tx_end(Timestamp::from_secs(10));
        assert_eq!(model.remaining_energy(), 0.0);
    }

    #[test]
    fn test_unmatched_end_is_harmless() {
        let mut model = LinearEnergyModel::new(5.0, 2.0, 1.0);
        model.on_tx_end(Timestamp::from_secs(1));
        model.on_rx_end(Timestamp::from_secs(1));
        assert_eq!(model.remaining_energy(), 5.0);
    }

    #[test]
    fn test_default_model_full() {
        let model = LinearEnergyModel::default();
        assert!(model.remaining_energy() > 0.0);
    }
}
