//! Distributed cluster formation
//!
//! Every node periodically broadcasts an NCCI with its channel qualities,
//! neighbor table, reachable clusters, and residual energy. From the cached
//! NCCIs each node scores itself and its neighbors with the fitness value
//!
//! ```text
//! V = b1*(E/Emax) + b2*(CF/CFmax) + b3*(NRC/NRCmax) + b4*(NN/NNmax)
//! ```
//!
//! where CF sums quality x supporter-count over the effective available
//! channels (those not already claimed by a known neighboring cluster).
//! The best-scored entity collects CH_REQs; with enough requests it
//! announces itself head, picks the cluster's active/backup data channels,
//! and pushes them into the MAC and routing layers. Heads appoint the
//! best-placed member toward each neighboring cluster as gateway.
//!
//! Everything here is soft state: caches expire, head status is
//! re-evaluated every cluster age, and lost messages are masked by the next
//! periodic resend.

use crate::config::ClusterConfig;
use crate::context::NetContext;
use crate::event::{ClusterTick, Event};
use crate::frame::NodeId;
use crate::mac::MacChannelAccess;
use crate::message::{
    ChannelQuality, ClusterReachability, ControlKind, ControlMessage, NeighborConnectivity,
};
use crate::routing::RoutingUnit;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::table::TtlMap;
use crate::traits::{EnergyMonitor, Phy, SpectrumEstimator};
use crate::wire;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// The role a node currently plays in the cluster structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    /// No cluster adopted yet.
    Unaffiliated,
    /// Member of a cluster.
    Member,
    /// Head of a cluster.
    Head,
    /// Member holding at least one live gateway appointment.
    Gateway,
}

/// Per-node cluster-formation state and timers.
pub struct ClusterCoordinator {
    address: NodeId,
    config: ClusterConfig,
    /// Latest channel-quality estimate from the spectrum estimator.
    quality: ChannelQuality,
    /// Rebuilt from cached NCCIs every table update.
    connectivity: NeighborConnectivity,
    /// Known neighboring clusters and their data channels.
    reachability: ClusterReachability,
    ncci_cache: TtlMap<NodeId, ControlMessage>,
    head_announcements: TtlMap<NodeId, ControlMessage>,
    head_requests: TtlMap<NodeId, ControlMessage>,
    join_requests: TtlMap<NodeId, ControlMessage>,
    gateway_grants: TtlMap<NodeId, ControlMessage>,
    /// Fitness of each NCCI-known neighbor, recomputed with the tables.
    v_values: BTreeMap<NodeId, f64>,
    v_self: f64,
    is_head: bool,
    head: Option<NodeId>,
    data_channels: Option<(u16, u16)>,
    timers: [Option<TimerHandle>; 5],
}

impl ClusterCoordinator {
    /// Create the coordinator for `address`.
    pub fn new(address: NodeId, config: ClusterConfig) -> Self {
        let lifetime = config.ctrl_msg_lifetime;
        Self {
            address,
            config,
            quality: ChannelQuality::new(),
            connectivity: NeighborConnectivity::new(),
            reachability: ClusterReachability::new(),
            ncci_cache: TtlMap::new(lifetime),
            head_announcements: TtlMap::new(lifetime),
            head_requests: TtlMap::new(lifetime),
            join_requests: TtlMap::new(lifetime),
            gateway_grants: TtlMap::new(lifetime),
            v_values: BTreeMap::new(),
            v_self: 0.0,
            is_head: false,
            head: None,
            data_channels: None,
            timers: [None; 5],
        }
    }

    /// This node's address.
    pub fn address(&self) -> NodeId {
        self.address
    }

    /// The role the node currently plays.
    pub fn role(&self, sched: &Scheduler) -> ClusterRole {
        if self.is_head {
            ClusterRole::Head
        } else if !self.gateway_grants.is_empty_live(sched.now()) {
            ClusterRole::Gateway
        } else if self.head.is_some() {
            ClusterRole::Member
        } else {
            ClusterRole::Unaffiliated
        }
    }

    /// Whether this node is a cluster head.
    pub fn is_head(&self) -> bool {
        self.is_head
    }

    /// The adopted cluster head, if any.
    pub fn head(&self) -> Option<NodeId> {
        self.head
    }

    /// The cluster's (CADC, CBDC), if assigned.
    pub fn data_channels(&self) -> Option<(u16, u16)> {
        self.data_channels
    }

    /// This node's own fitness value from the last table update.
    pub fn fitness_self(&self) -> f64 {
        self.v_self
    }

    /// Live NCCI-known neighbors.
    pub fn neighbor_count(&self, sched: &Scheduler) -> usize {
        self.ncci_cache.len_live(sched.now())
    }

    /// Arm all periodic timers. Call once after construction.
    ///
    /// The first firing of each timer is staggered by an address-derived
    /// offset so that co-started nodes do not advertise in lockstep; the
    /// offset persists across re-arms, desynchronizing the whole run.
    pub fn start(&mut self, sched: &mut Scheduler) {
        let stagger =
            Duration::from_micros((self.address.to_u32() as u64).wrapping_mul(977) % 50_000);
        self.arm(
            sched,
            ClusterTick::Advertise,
            self.config.advertise_period + stagger,
        );
        self.arm(
            sched,
            ClusterTick::TableUpdate,
            self.config.table_update_period + stagger,
        );
        self.arm(
            sched,
            ClusterTick::Candidacy,
            self.config.candidacy_period + stagger,
        );
        self.arm(sched, ClusterTick::ClusterAge, self.config.cluster_age + stagger);
        self.arm(
            sched,
            ClusterTick::SensingWindow,
            self.config.sensing_period + stagger,
        );
    }

    /// Cancel all periodic timers.
    pub fn stop(&mut self, sched: &mut Scheduler) {
        for slot in self.timers.iter_mut() {
            if let Some(handle) = slot.take() {
                sched.cancel(handle);
            }
        }
    }

    /// A fresh channel-quality map arrived from the spectrum estimator.
    pub fn on_quality_update(&mut self, qualities: &[(u16, f64)]) {
        self.quality = qualities.iter().copied().collect();
    }

    /// Handle one periodic tick, then re-arm it.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_tick<P: Phy, E: EnergyMonitor, S: SpectrumEstimator>(
        &mut self,
        tick: ClusterTick,
        routing: &mut RoutingUnit,
        mac: &mut MacChannelAccess,
        phy: &mut P,
        energy: &mut E,
        estimator: &S,
        sched: &mut Scheduler,
        ctx: &mut NetContext,
    ) {
        match tick {
            ClusterTick::Advertise => {
                self.advertise(routing, mac, phy, energy, sched, ctx);
                self.arm(sched, tick, self.config.advertise_period);
            }
            ClusterTick::TableUpdate => {
                self.update_tables(energy, sched);
                self.arm(sched, tick, self.config.table_update_period);
            }
            ClusterTick::Candidacy => {
                self.choose_candidate(routing, mac, phy, sched, ctx);
                self.arm(sched, tick, self.config.candidacy_period);
            }
            ClusterTick::ClusterAge => {
                self.evaluate_cluster(routing, mac, phy, sched, ctx);
                self.arm(sched, tick, self.config.cluster_age);
            }
            ClusterTick::SensingWindow => {
                mac.stop_for_sensing(estimator.sensing_window(), phy, energy, sched);
                self.arm(sched, tick, self.config.sensing_period);
            }
        }
    }

    /// A control message addressed to (or overheard by) this node arrived.
    pub fn on_control_message(
        &mut self,
        msg: ControlMessage,
        routing: &mut RoutingUnit,
        sched: &mut Scheduler,
    ) {
        let now = sched.now();
        let source = msg.source();
        if source == self.address {
            return;
        }
        match msg.kind() {
            ControlKind::Ncci => {
                trace!(node = %self.address, from = %source, "caching NCCI");
                self.ncci_cache.insert(source, msg, now);
            }
            ControlKind::HeadAnnounce => {
                self.head_announcements.insert(source, msg, now);
            }
            ControlKind::HeadRequest => {
                if msg.destination() == self.address {
                    self.head_requests.insert(source, msg, now);
                }
            }
            ControlKind::JoinRequest => {
                if msg.destination() == self.address {
                    self.join_requests.insert(source, msg, now);
                }
            }
            ControlKind::GatewayAnnounce => {
                if msg.destination() == self.address {
                    debug!(node = %self.address, head = %source, "appointed gateway");
                    self.gateway_grants.insert(source, msg, now);
                    routing.set_gateway_status(true);
                }
            }
        }
    }

    /// Broadcast the periodic NCCI.
    fn advertise<P: Phy, E: EnergyMonitor>(
        &mut self,
        routing: &mut RoutingUnit,
        mac: &mut MacChannelAccess,
        phy: &mut P,
        energy: &mut E,
        sched: &mut Scheduler,
        ctx: &mut NetContext,
    ) {
        let id = ctx.next_packet_id();
        let msg = ControlMessage::new(
            ControlKind::Ncci,
            id,
            self.address,
            NodeId::BROADCAST,
            sched.now(),
        )
        .with_channel_quality(self.quality.clone())
        .with_neighbor_connectivity(self.connectivity.clone())
        .with_cluster_reachability(self.reachability.clone())
        .with_energy(energy.remaining_energy())
        .with_origin_node(self.address.to_u32());

        self.send_message(msg, NodeId::BROADCAST, routing, mac, phy, sched, ctx);
    }

    /// Rebuild the connectivity and reachability tables from the live NCCI
    /// cache, then recompute every fitness value.
    fn update_tables<E: EnergyMonitor>(&mut self, energy: &mut E, sched: &mut Scheduler) {
        let now = sched.now();
        self.ncci_cache.purge_expired(now);
        self.head_announcements.purge_expired(now);
        self.head_requests.purge_expired(now);
        self.join_requests.purge_expired(now);
        self.gateway_grants.purge_expired(now);

        self.connectivity = self
            .ncci_cache
            .iter_live(now)
            .map(|(sender, msg)| {
                let channels: BTreeSet<u16> = msg.channel_quality().keys().copied().collect();
                (*sender, channels)
            })
            .collect();

        // Direct announcements first, then what the neighbors report.
        let mut reachability: ClusterReachability = self
            .head_announcements
            .iter_live(now)
            .map(|(head, msg)| (*head, (msg.cadc(), msg.cbdc())))
            .collect();
        for (_, msg) in self.ncci_cache.iter_live(now) {
            for (head, channels) in msg.cluster_reachability() {
                reachability.entry(*head).or_insert(*channels);
            }
        }
        reachability.remove(&self.address);
        self.reachability = reachability;

        self.v_self = self.fitness(
            &self.quality,
            &self.connectivity,
            &self.reachability,
            energy.remaining_energy(),
        );
        self.v_values = self
            .ncci_cache
            .iter_live(now)
            .map(|(sender, msg)| {
                let v = self.fitness(
                    msg.channel_quality(),
                    msg.neighbor_connectivity(),
                    msg.cluster_reachability(),
                    msg.energy(),
                );
                (*sender, v)
            })
            .collect();
    }

    /// The composite fitness score V.
    fn fitness(
        &self,
        quality: &ChannelQuality,
        connectivity: &NeighborConnectivity,
        reachability: &ClusterReachability,
        energy: f64,
    ) -> f64 {
        let claimed: BTreeSet<u16> = reachability
            .values()
            .flat_map(|(cadc, cbdc)| [*cadc, *cbdc])
            .collect();
        let channel_fitness: f64 = quality
            .iter()
            .filter(|(channel, _)| !claimed.contains(*channel))
            .map(|(channel, q)| {
                let supporters = connectivity
                    .values()
                    .filter(|channels| channels.contains(channel))
                    .count();
                q * supporters as f64
            })
            .sum();

        let c = &self.config;
        c.beta1 * (energy / c.energy_max)
            + c.beta2 * (channel_fitness / c.channel_fitness_max)
            + c.beta3 * (reachability.len() as f64 / c.neighbor_clusters_max as f64)
            + c.beta4 * (connectivity.len() as f64 / c.neighbors_max as f64)
    }

    /// Pick the highest-V entity; if it is a neighbor, ask it to lead.
    fn choose_candidate<P: Phy>(
        &mut self,
        routing: &mut RoutingUnit,
        mac: &mut MacChannelAccess,
        phy: &mut P,
        sched: &mut Scheduler,
        ctx: &mut NetContext,
    ) {
        let best_neighbor = self
            .v_values
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));
        let Some((&candidate, &v)) = best_neighbor else {
            return;
        };
        if v <= self.v_self {
            return; // we are the best candidate ourselves
        }
        assert_ne!(
            candidate, self.address,
            "cluster-head request addressed to self"
        );
        trace!(node = %self.address, candidate = %candidate, v, "requesting cluster head");
        let id = ctx.next_packet_id();
        let msg = ControlMessage::new(
            ControlKind::HeadRequest,
            id,
            self.address,
            candidate,
            sched.now(),
        )
        .with_origin_node(self.address.to_u32());
        self.send_message(msg, candidate, routing, mac, phy, sched, ctx);
    }

    /// Head evaluation, member evaluation, gateway election.
    fn evaluate_cluster<P: Phy>(
        &mut self,
        routing: &mut RoutingUnit,
        mac: &mut MacChannelAccess,
        phy: &mut P,
        sched: &mut Scheduler,
        ctx: &mut NetContext,
    ) {
        let now = sched.now();
        let neighbor_count = self.ncci_cache.len_live(now);
        let requests = self.head_requests.len_live(now);

        if neighbor_count > 0 && requests as f64 >= self.config.eta * neighbor_count as f64 {
            self.become_head(routing, mac, phy, sched, ctx);
        } else {
            if self.is_head {
                debug!(node = %self.address, "relinquishing cluster head");
                self.is_head = false;
                self.data_channels = None;
                routing.set_cluster_head_status(false);
            }
            self.evaluate_membership(routing, mac, phy, sched, ctx);
        }

        if self.is_head {
            self.elect_gateways(routing, mac, phy, sched, ctx);
        }
        // Gateway status lasts only while a grant is live.
        if !self.is_head {
            routing.set_gateway_status(!self.gateway_grants.is_empty_live(now));
        }
    }

    fn become_head<P: Phy>(
        &mut self,
        routing: &mut RoutingUnit,
        mac: &mut MacChannelAccess,
        phy: &mut P,
        sched: &mut Scheduler,
        ctx: &mut NetContext,
    ) {
        let Some((cadc, cbdc)) = self.select_data_channels() else {
            warn!(node = %self.address, "no usable channels, cannot lead a cluster");
            return;
        };
        if !self.is_head || self.data_channels != Some((cadc, cbdc)) {
            debug!(node = %self.address, cadc, cbdc, "announcing cluster head");
        }
        self.is_head = true;
        self.head = Some(self.address);
        self.data_channels = Some((cadc, cbdc));

        let id = ctx.next_packet_id();
        let msg = ControlMessage::new(
            ControlKind::HeadAnnounce,
            id,
            self.address,
            NodeId::BROADCAST,
            sched.now(),
        )
        .with_data_channels(cadc, cbdc)
        .with_origin_node(self.address.to_u32());
        self.send_message(msg, NodeId::BROADCAST, routing, mac, phy, sched, ctx);

        routing.set_cluster_head_status(true);
        routing.set_cluster(self.address);
        mac.set_data_channels(cadc, cbdc, self.address, phy, sched);
    }

    /// The two channels maximizing quality x supporter count over the
    /// effective available set.
    fn select_data_channels(&self) -> Option<(u16, u16)> {
        let claimed: BTreeSet<u16> = self
            .reachability
            .values()
            .flat_map(|(cadc, cbdc)| [*cadc, *cbdc])
            .collect();
        let mut candidates: BTreeSet<u16> = self.quality.keys().copied().collect();
        for channels in self.connectivity.values() {
            candidates.extend(channels.iter().copied());
        }

        let mut scored: Vec<(u16, f64)> = candidates
            .into_iter()
            .filter(|channel| !claimed.contains(channel))
            .map(|channel| {
                let q = self.quality.get(&channel).copied().unwrap_or(0.0);
                let supporters = self
                    .connectivity
                    .values()
                    .filter(|channels| channels.contains(&channel))
                    .count();
                (channel, q * supporters as f64)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let cadc = scored.first()?.0;
        let cbdc = scored.get(1).map(|(c, _)| *c).unwrap_or(cadc);
        Some((cadc, cbdc))
    }

    /// Adopt the best-scored announcer as cluster head.
    fn evaluate_membership<P: Phy>(
        &mut self,
        routing: &mut RoutingUnit,
        mac: &mut MacChannelAccess,
        phy: &mut P,
        sched: &mut Scheduler,
        ctx: &mut NetContext,
    ) {
        let now = sched.now();
        let best = self
            .head_announcements
            .iter_live(now)
            .max_by(|(a, _), (b, _)| {
                let va = self.v_values.get(*a).copied().unwrap_or(0.0);
                let vb = self.v_values.get(*b).copied().unwrap_or(0.0);
                va.partial_cmp(&vb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(head, msg)| (*head, msg.cadc(), msg.cbdc()));

        let Some((head, cadc, cbdc)) = best else {
            if self.head.take().is_some() {
                routing.unset_cluster();
                self.data_channels = None;
            }
            return;
        };

        let rejoining = self.head != Some(head);
        self.head = Some(head);
        self.data_channels = Some((cadc, cbdc));
        routing.set_cluster(head);
        mac.set_data_channels(cadc, cbdc, head, phy, sched);

        if rejoining {
            debug!(node = %self.address, head = %head, "joining cluster");
        }
        let id = ctx.next_packet_id();
        let msg = ControlMessage::new(ControlKind::JoinRequest, id, self.address, head, sched.now())
            .with_origin_node(self.address.to_u32());
        self.send_message(msg, head, routing, mac, phy, sched, ctx);
    }

    /// For each neighboring cluster, appoint the member best placed on both
    /// clusters' active channels as gateway.
    fn elect_gateways<P: Phy>(
        &mut self,
        routing: &mut RoutingUnit,
        mac: &mut MacChannelAccess,
        phy: &mut P,
        sched: &mut Scheduler,
        ctx: &mut NetContext,
    ) {
        let now = sched.now();
        let Some((own_cadc, _)) = self.data_channels else {
            return;
        };

        let appointments: Vec<(NodeId, NodeId, u16)> = self
            .reachability
            .iter()
            .filter_map(|(other_head, (other_cadc, _))| {
                let best_member = self
                    .join_requests
                    .iter_live(now)
                    .filter_map(|(member, _)| {
                        let ncci = self.ncci_cache.get(member, now)?;
                        let quality = ncci.channel_quality();
                        let own = quality.get(&own_cadc).copied().unwrap_or(0.0);
                        let theirs = quality.get(other_cadc).copied().unwrap_or(0.0);
                        Some((*member, (own + theirs) / 2.0))
                    })
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                best_member.map(|(member, _)| (member, *other_head, *other_cadc))
            })
            .collect();

        for (member, other_head, other_cadc) in appointments {
            trace!(node = %self.address, member = %member, toward = %other_head, "appointing gateway");
            let id = ctx.next_packet_id();
            let msg = ControlMessage::new(
                ControlKind::GatewayAnnounce,
                id,
                self.address,
                member,
                sched.now(),
            )
            .with_data_channels(own_cadc, other_cadc)
            .with_origin_node(self.address.to_u32());
            self.send_message(msg, member, routing, mac, phy, sched, ctx);
        }
    }

    /// Register the message for the receive path and put it on the air.
    #[allow(clippy::too_many_arguments)]
    fn send_message<P: Phy>(
        &mut self,
        msg: ControlMessage,
        dest: NodeId,
        routing: &mut RoutingUnit,
        mac: &mut MacChannelAccess,
        phy: &mut P,
        sched: &mut Scheduler,
        ctx: &mut NetContext,
    ) {
        let payload = match wire::encode_message(&msg) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(node = %self.address, %err, "control message over budget, dropping");
                return;
            }
        };
        let id = msg.packet_id();
        ctx.register_message(msg, sched.now());
        routing.send_control(id, payload, dest, mac, phy, sched, ctx);
    }

    fn arm(&mut self, sched: &mut Scheduler, tick: ClusterTick, period: Duration) {
        let slot = match tick {
            ClusterTick::Advertise => 0,
            ClusterTick::TableUpdate => 1,
            ClusterTick::Candidacy => 2,
            ClusterTick::ClusterAge => 3,
            ClusterTick::SensingWindow => 4,
        };
        if let Some(handle) = self.timers[slot].take() {
            sched.cancel(handle);
        }
        self.timers[slot] = Some(sched.schedule_after(
            period,
            Event::Cluster {
                node: self.address,
                tick,
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataRate, MacConfig, RoutingConfig};
    use crate::frame::PacketId;
    use crate::time::Timestamp;

    struct StubPhy {
        channel: Option<u16>,
    }

    impl Phy for StubPhy {
        fn start_tx(&mut self, _frame: &crate::frame::LinkFrame) -> bool {
            true
        }
        fn carrier_sense(&mut self, _channel: u16) -> f64 {
            0.0
        }
        fn set_channel(&mut self, channel: u16) {
            self.channel = Some(channel);
        }
        fn abort_tx(&mut self) {}
    }

    struct FixedEnergy(f64);

    impl EnergyMonitor for FixedEnergy {
        fn remaining_energy(&self) -> f64 {
            self.0
        }
        fn on_tx_start(&mut self, _now: Timestamp) {}
        fn on_tx_end(&mut self, _now: Timestamp) {}
        fn on_rx_start(&mut self, _now: Timestamp) {}
        fn on_rx_end(&mut self, _now: Timestamp) {}
    }

    struct StubEstimator;

    impl SpectrumEstimator for StubEstimator {
        fn sensing_window(&self) -> Duration {
            Duration::from_micros(50)
        }
    }

    struct Harness {
        coordinator: ClusterCoordinator,
        routing: RoutingUnit,
        mac: MacChannelAccess,
        phy: StubPhy,
        energy: FixedEnergy,
        sched: Scheduler,
        ctx: NetContext,
    }

    fn harness(addr: u32) -> Harness {
        let address = NodeId::from_u32(addr);
        let config = ClusterConfig::default();
        Harness {
            coordinator: ClusterCoordinator::new(address, config.clone()),
            routing: RoutingUnit::new(address, RoutingConfig::default(), DataRate::default()),
            mac: MacChannelAccess::new(address, MacConfig::default()),
            phy: StubPhy { channel: None },
            energy: FixedEnergy(80.0),
            sched: Scheduler::new(),
            ctx: NetContext::new(config.ctrl_msg_lifetime),
        }
    }

    fn ncci(from: u32, channels: &[(u16, f64)], energy: f64, id: u64) -> ControlMessage {
        ControlMessage::new(
            ControlKind::Ncci,
            PacketId(id),
            NodeId::from_u32(from),
            NodeId::BROADCAST,
            Timestamp::ZERO,
        )
        .with_channel_quality(channels.iter().copied().collect())
        .with_energy(energy)
    }

    fn head_request(from: u32, to: u32, id: u64) -> ControlMessage {
        ControlMessage::new(
            ControlKind::HeadRequest,
            PacketId(id),
            NodeId::from_u32(from),
            NodeId::from_u32(to),
            Timestamp::ZERO,
        )
    }

    #[test]
    fn test_fitness_monotonic_in_energy_and_neighbors() {
        let h = harness(1);
        let quality: ChannelQuality = [(1, 0.5), (2, 0.8)].into_iter().collect();
        let reach = ClusterReachability::new();

        let two_neighbors: NeighborConnectivity = (2u32..4)
            .map(|n| (NodeId::from_u32(n), BTreeSet::from([1u16, 2u16])))
            .collect();
        let four_neighbors: NeighborConnectivity = (2u32..6)
            .map(|n| (NodeId::from_u32(n), BTreeSet::from([1u16, 2u16])))
            .collect();

        // Non-decreasing in residual energy, other terms fixed.
        let low_e = h.coordinator.fitness(&quality, &two_neighbors, &reach, 10.0);
        let high_e = h.coordinator.fitness(&quality, &two_neighbors, &reach, 90.0);
        assert!(high_e > low_e);

        // Non-decreasing in neighbor count, other terms fixed.
        let few = h.coordinator.fitness(&quality, &two_neighbors, &reach, 50.0);
        let many = h.coordinator.fitness(&quality, &four_neighbors, &reach, 50.0);
        assert!(many > few);
    }

    #[test]
    fn test_claimed_channels_excluded_from_fitness() {
        let h = harness(1);
        let quality: ChannelQuality = [(1, 0.9)].into_iter().collect();
        let connectivity: NeighborConnectivity = [
            (NodeId::from_u32(2), BTreeSet::from([1u16])),
            (NodeId::from_u32(3), BTreeSet::from([1u16])),
        ]
        .into_iter()
        .collect();

        let unclaimed = h
            .coordinator
            .fitness(&quality, &connectivity, &ClusterReachability::new(), 50.0);
        let claimed: ClusterReachability =
            [(NodeId::from_u32(9), (1u16, 1u16))].into_iter().collect();
        let with_claim = h.coordinator.fitness(&quality, &connectivity, &claimed, 50.0);
        // Channel 1 claimed by a neighboring cluster: CF contribution gone,
        // though the NRC term adds a little back.
        assert!(with_claim < unclaimed);
    }

    #[test]
    fn test_head_election_with_enough_requests() {
        let mut h = harness(1);
        // 10 NCCI-known neighbors, channel 4 best supported, channel 9 next.
        for n in 2..12u32 {
            let msg = ncci(n, &[(4, 0.9), (9, 0.7), (13, 0.1)], 50.0, 100 + n as u64);
            h.coordinator
                .on_control_message(msg, &mut h.routing, &mut h.sched);
        }
        h.coordinator.on_quality_update(&[(4, 0.9), (9, 0.7), (13, 0.1)]);
        h.coordinator.update_tables(&mut h.energy, &mut h.sched);

        // Five CH_REQs: exactly eta (0.5) x 10 neighbors.
        for n in 2..7u32 {
            let msg = head_request(n, 1, 200 + n as u64);
            h.coordinator
                .on_control_message(msg, &mut h.routing, &mut h.sched);
        }

        h.coordinator.evaluate_cluster(
            &mut h.routing,
            &mut h.mac,
            &mut h.phy,
            &mut h.sched,
            &mut h.ctx,
        );

        assert!(h.coordinator.is_head());
        // quality x supporters: ch4 = 0.9*10, ch9 = 0.7*10, ch13 = 0.1*10.
        assert_eq!(h.coordinator.data_channels(), Some((4, 9)));
        // Pushed down to the MAC (active channel) and routing.
        assert_eq!(h.phy.channel, Some(4));
        assert_eq!(h.routing.cluster_head(), Some(NodeId::from_u32(1)));
        assert!(h.ctx.counters.control_bytes > 0);
    }

    #[test]
    fn test_too_few_requests_relinquishes_head() {
        let mut h = harness(1);
        for n in 2..12u32 {
            let msg = ncci(n, &[(4, 0.9)], 50.0, 100 + n as u64);
            h.coordinator
                .on_control_message(msg, &mut h.routing, &mut h.sched);
        }
        h.coordinator.on_quality_update(&[(4, 0.9)]);
        h.coordinator.update_tables(&mut h.energy, &mut h.sched);
        for n in 2..12u32 {
            let msg = head_request(n, 1, 200 + n as u64);
            h.coordinator
                .on_control_message(msg, &mut h.routing, &mut h.sched);
        }
        h.coordinator.evaluate_cluster(
            &mut h.routing,
            &mut h.mac,
            &mut h.phy,
            &mut h.sched,
            &mut h.ctx,
        );
        assert!(h.coordinator.is_head());

        // Requests expire; the next cluster age finds 4 < 0.5 x 10.
        h.coordinator.head_requests.clear();
        for n in 2..6u32 {
            let msg = head_request(n, 1, 300 + n as u64);
            h.coordinator
                .on_control_message(msg, &mut h.routing, &mut h.sched);
        }
        h.coordinator.evaluate_cluster(
            &mut h.routing,
            &mut h.mac,
            &mut h.phy,
            &mut h.sched,
            &mut h.ctx,
        );
        assert!(!h.coordinator.is_head());
        assert_eq!(h.coordinator.data_channels(), None);
    }

    #[test]
    fn test_member_adopts_best_announcer() {
        let mut h = harness(1);
        // Two announcers; 3 is fitter (more energy).
        for (n, energy) in [(2u32, 20.0), (3u32, 90.0)] {
            let msg = ncci(n, &[(4, 0.5)], energy, 100 + n as u64);
            h.coordinator
                .on_control_message(msg, &mut h.routing, &mut h.sched);
        }
        h.coordinator.update_tables(&mut h.energy, &mut h.sched);
        for (n, cadc) in [(2u32, 5u16), (3u32, 7u16)] {
            let msg = ControlMessage::new(
                ControlKind::HeadAnnounce,
                PacketId(400 + n as u64),
                NodeId::from_u32(n),
                NodeId::BROADCAST,
                Timestamp::ZERO,
            )
            .with_data_channels(cadc, cadc + 1);
            h.coordinator
                .on_control_message(msg, &mut h.routing, &mut h.sched);
        }

        h.coordinator.evaluate_cluster(
            &mut h.routing,
            &mut h.mac,
            &mut h.phy,
            &mut h.sched,
            &mut h.ctx,
        );

        assert_eq!(h.coordinator.head(), Some(NodeId::from_u32(3)));
        assert_eq!(h.coordinator.data_channels(), Some((7, 8)));
        assert_eq!(h.routing.cluster_head(), Some(NodeId::from_u32(3)));
        assert_eq!(h.coordinator.role(&h.sched), ClusterRole::Member);
        assert_eq!(h.phy.channel, Some(7));
    }

    #[test]
    fn test_gateway_appointment_and_status() {
        let mut h = harness(1);
        // Become head with two members; a neighboring cluster at head 20
        // uses CADC 6.
        for n in 2..4u32 {
            let msg = ncci(n, &[(4, 0.8), (6, 0.3 + n as f64 / 10.0)], 50.0, 100 + n as u64);
            h.coordinator
                .on_control_message(msg, &mut h.routing, &mut h.sched);
        }
        let other_head = ControlMessage::new(
            ControlKind::HeadAnnounce,
            PacketId(500),
            NodeId::from_u32(20),
            NodeId::BROADCAST,
            Timestamp::ZERO,
        )
        .with_data_channels(6, 7);
        h.coordinator
            .on_control_message(other_head, &mut h.routing, &mut h.sched);
        h.coordinator.on_quality_update(&[(4, 0.8)]);
        h.coordinator.update_tables(&mut h.energy, &mut h.sched);

        for n in 2..4u32 {
            h.coordinator.on_control_message(
                head_request(n, 1, 200 + n as u64),
                &mut h.routing,
                &mut h.sched,
            );
            h.coordinator.on_control_message(
                ControlMessage::new(
                    ControlKind::JoinRequest,
                    PacketId(300 + n as u64),
                    NodeId::from_u32(n),
                    NodeId::from_u32(1),
                    Timestamp::ZERO,
                ),
                &mut h.routing,
                &mut h.sched,
            );
        }

        let control_bytes_before = h.ctx.counters.control_bytes;
        h.coordinator.evaluate_cluster(
            &mut h.routing,
            &mut h.mac,
            &mut h.phy,
            &mut h.sched,
            &mut h.ctx,
        );
        assert!(h.coordinator.is_head());
        // CH_ANM + one GH_ANM toward cluster 20 went out.
        assert!(h.ctx.counters.control_bytes > control_bytes_before);

        // The appointed member (3, best average on channels 4 and 6)
        // becomes a gateway when the grant arrives.
        let mut member = harness(3);
        let grant = ControlMessage::new(
            ControlKind::GatewayAnnounce,
            PacketId(600),
            NodeId::from_u32(1),
            NodeId::from_u32(3),
            Timestamp::ZERO,
        )
        .with_data_channels(4, 6);
        member
            .coordinator
            .on_control_message(grant, &mut member.routing, &mut member.sched);
        assert_eq!(member.coordinator.role(&member.sched), ClusterRole::Gateway);
    }

    #[test]
    fn test_candidacy_requests_best_neighbor() {
        let mut h = harness(1);
        let msg = ncci(5, &[(4, 0.9), (9, 0.9)], 99.0, 100);
        h.coordinator
            .on_control_message(msg, &mut h.routing, &mut h.sched);
        // A weak self: no quality map, little energy.
        h.energy = FixedEnergy(5.0);
        h.coordinator.update_tables(&mut h.energy, &mut h.sched);
        assert!(h.coordinator.fitness_self() < *h.coordinator.v_values.values().next().unwrap());

        let before = h.ctx.counters.control_bytes;
        h.coordinator.choose_candidate(
            &mut h.routing,
            &mut h.mac,
            &mut h.phy,
            &mut h.sched,
            &mut h.ctx,
        );
        assert!(h.ctx.counters.control_bytes > before, "CH_REQ must be sent");
    }

    #[test]
    fn test_ncci_expiry_shrinks_neighborhood() {
        let mut h = harness(1);
        let msg = ncci(2, &[(4, 0.5)], 50.0, 100);
        h.coordinator
            .on_control_message(msg, &mut h.routing, &mut h.sched);
        assert_eq!(h.coordinator.neighbor_count(&h.sched), 1);

        // Advance past the control-message lifetime.
        let lifetime = h.coordinator.config.ctrl_msg_lifetime;
        h.sched.schedule_after(
            lifetime + Duration::from_millis(1),
            Event::Cluster {
                node: NodeId::from_u32(1),
                tick: ClusterTick::TableUpdate,
            },
        );
        h.sched.pop_next();
        h.coordinator.update_tables(&mut h.energy, &mut h.sched);

        assert_eq!(h.coordinator.neighbor_count(&h.sched), 0);
        assert!(h.coordinator.connectivity.is_empty());
    }

    #[test]
    fn test_periodic_timers_rearm() {
        let mut h = harness(1);
        h.coordinator.start(&mut h.sched);
        assert_eq!(h.sched.pending(), 5);

        // Fire the first tick (Advertise); the handler re-arms it, and the
        // NCCI it queued starts a MAC access attempt on the control channel.
        let (_, event) = h.sched.pop_next().unwrap();
        if let Event::Cluster { tick, .. } = event {
            h.coordinator.handle_tick(
                tick,
                &mut h.routing,
                &mut h.mac,
                &mut h.phy,
                &mut h.energy,
                &StubEstimator,
                &mut h.sched,
                &mut h.ctx,
            );
        }
        assert_eq!(h.sched.pending(), 6);

        h.coordinator.stop(&mut h.sched);
        // Only the MAC's access callback remains.
        assert_eq!(h.sched.pending(), 1);
    }
}
