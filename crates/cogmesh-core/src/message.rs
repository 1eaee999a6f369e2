//! Cluster-formation control messages
//!
//! Five message kinds drive the distributed clustering protocol: the
//! periodic NCCI connectivity broadcast, cluster-head requests and
//! announcements, membership joins, and gateway announcements. Messages are
//! soft state end to end — a receiver caches them keyed by sender and lets
//! them expire; there are no acknowledgements.

use crate::frame::{NodeId, PacketId};
use crate::time::Timestamp;
use std::collections::{BTreeMap, BTreeSet};

/// Channel index → learned quality of that channel.
pub type ChannelQuality = BTreeMap<u16, f64>;

/// Neighbor address → the set of channels it reports available.
pub type NeighborConnectivity = BTreeMap<NodeId, BTreeSet<u16>>;

/// Cluster-head address → that cluster's (CADC, CBDC).
pub type ClusterReachability = BTreeMap<NodeId, (u16, u16)>;

/// The kind of a cluster control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    /// Neighbor/cluster connectivity information broadcast.
    Ncci,
    /// Cluster-head announcement.
    HeadAnnounce,
    /// Request that the receiver become cluster head.
    HeadRequest,
    /// Join the sender to the receiver's cluster.
    JoinRequest,
    /// Appoint the receiver as gateway toward another cluster.
    GatewayAnnounce,
}

/// A cluster-formation control message.
///
/// Built with [`ControlMessage::new`] plus the `with_*` setters for the
/// fields a given kind carries; fields a kind does not use stay empty.
#[derive(Debug, Clone)]
pub struct ControlMessage {
    kind: ControlKind,
    source: NodeId,
    destination: NodeId,
    created: Timestamp,
    packet_id: PacketId,
    channel_quality: ChannelQuality,
    neighbor_connectivity: NeighborConnectivity,
    cluster_reachability: ClusterReachability,
    /// Residual energy of the sender, joules.
    energy: f64,
    cadc: u16,
    cbdc: u16,
    /// Numeric id of the originating node (for traces).
    origin_node: u32,
}

impl ControlMessage {
    /// Create a message of `kind` from `source` to `destination`.
    pub fn new(
        kind: ControlKind,
        packet_id: PacketId,
        source: NodeId,
        destination: NodeId,
        now: Timestamp,
    ) -> Self {
        Self {
            kind,
            source,
            destination,
            created: now,
            packet_id,
            channel_quality: ChannelQuality::new(),
            neighbor_connectivity: NeighborConnectivity::new(),
            cluster_reachability: ClusterReachability::new(),
            energy: 0.0,
            cadc: 0,
            cbdc: 0,
            origin_node: 0,
        }
    }

    /// Attach the channel-quality map (NCCI).
    pub fn with_channel_quality(mut self, map: ChannelQuality) -> Self {
        self.channel_quality = map;
        self
    }

    /// Attach the neighbor-connectivity table (NCCI).
    pub fn with_neighbor_connectivity(mut self, map: NeighborConnectivity) -> Self {
        self.neighbor_connectivity = map;
        self
    }

    /// Attach the neighbor-cluster reachability table (NCCI).
    pub fn with_cluster_reachability(mut self, map: ClusterReachability) -> Self {
        self.cluster_reachability = map;
        self
    }

    /// Attach the sender's residual energy (NCCI).
    pub fn with_energy(mut self, energy: f64) -> Self {
        self.energy = energy;
        self
    }

    /// Attach the announced data channels (CH_ANM / GH_ANM).
    pub fn with_data_channels(mut self, cadc: u16, cbdc: u16) -> Self {
        self.cadc = cadc;
        self.cbdc = cbdc;
        self
    }

    /// Attach the originating node id.
    pub fn with_origin_node(mut self, id: u32) -> Self {
        self.origin_node = id;
        self
    }

    /// The message kind.
    pub fn kind(&self) -> ControlKind {
        self.kind
    }

    /// The sender address.
    pub fn source(&self) -> NodeId {
        self.source
    }

    /// The destination address (broadcast for NCCI/CH_ANM).
    pub fn destination(&self) -> NodeId {
        self.destination
    }

    /// Creation time.
    pub fn created(&self) -> Timestamp {
        self.created
    }

    /// Id of the packet carrying this message.
    pub fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    /// Channel → quality as advertised by the sender.
    pub fn channel_quality(&self) -> &ChannelQuality {
        &self.channel_quality
    }

    /// The sender's view of its neighbors' available channels.
    pub fn neighbor_connectivity(&self) -> &NeighborConnectivity {
        &self.neighbor_connectivity
    }

    /// The sender's view of reachable clusters and their data channels.
    pub fn cluster_reachability(&self) -> &ClusterReachability {
        &self.cluster_reachability
    }

    /// Residual energy of the sender, joules.
    pub fn energy(&self) -> f64 {
        self.energy
    }

    /// Announced common active data channel.
    pub fn cadc(&self) -> u16 {
        self.cadc
    }

    /// Announced common backup data channel.
    pub fn cbdc(&self) -> u16 {
        self.cbdc
    }

    /// Numeric id of the originating node.
    pub fn origin_node(&self) -> u32 {
        self.origin_node
    }
}
