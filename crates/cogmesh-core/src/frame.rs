//! Link frames
//!
//! A [`LinkFrame`] is the unit everything below the routing table moves
//! around: the RTS/CTS/DATA/ACK handshake frames and the routing-plane
//! variants (route request / reply / error). The original endpoints are
//! fixed at creation and survive every relay; only the current-hop endpoints
//! are rewritten as the frame moves.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Link-layer address - 4-byte unique ID.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 4]);

impl NodeId {
    /// Broadcast address (all 0xFF).
    pub const BROADCAST: NodeId = NodeId([0xFF, 0xFF, 0xFF, 0xFF]);

    /// Unset address (all 0x00).
    pub const UNSPECIFIED: NodeId = NodeId([0x00, 0x00, 0x00, 0x00]);

    /// Create a NodeId from 4 bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        NodeId(bytes)
    }

    /// Create a NodeId from a u32.
    pub fn from_u32(value: u32) -> Self {
        NodeId(value.to_be_bytes())
    }

    /// Convert to u32.
    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Check if this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Check if this address is unset.
    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeId({:02x}{:02x}{:02x}{:02x})",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Identifier of the payload packet a frame carries, unique per run.
///
/// Allocated by [`crate::context::NetContext`]; handshake frames spawned for
/// a data frame share its id so replies can be matched to the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(pub u64);

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of a link frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// Request to send.
    Rts,
    /// Clear to send.
    Cts,
    /// Payload-bearing data frame.
    Data,
    /// Acknowledgement.
    Ack,
    /// Route request (routing plane).
    RouteRequest,
    /// Route reply (routing plane).
    RouteReply,
    /// Route error (routing plane).
    RouteError,
}

impl FrameKind {
    /// True for the routing-plane frame kinds.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            FrameKind::RouteRequest | FrameKind::RouteReply | FrameKind::RouteError
        )
    }
}

/// A frame exchanged on the link.
///
/// `original_*` endpoints never change after construction; the `current_*`
/// hop endpoints are the only routing metadata a relay may rewrite.
#[derive(Debug, Clone)]
pub struct LinkFrame {
    kind: FrameKind,
    original_sender: NodeId,
    original_receiver: NodeId,
    current_sender: NodeId,
    current_receiver: NodeId,
    /// Channel reservation signalled to overhearing interfaces.
    nav: Duration,
    created: Timestamp,
    arrival: Option<Timestamp>,
    packet_id: PacketId,
    protocol: u16,
    payload: Vec<u8>,
    /// Target of a route request / reply.
    required: Option<NodeId>,
    /// Accumulated path delay carried by a route reply, in seconds.
    path_delay: f64,
    /// The (upstream, downstream) pair of a failed link in a route error.
    faulty_link: Option<(NodeId, NodeId)>,
}

impl LinkFrame {
    /// Create a data frame. Current-hop endpoints start equal to the
    /// original endpoints; relays rewrite them with [`set_current_hop`].
    ///
    /// [`set_current_hop`]: LinkFrame::set_current_hop
    pub fn data(
        packet_id: PacketId,
        sender: NodeId,
        receiver: NodeId,
        protocol: u16,
        payload: Vec<u8>,
        now: Timestamp,
    ) -> Self {
        Self {
            kind: FrameKind::Data,
            original_sender: sender,
            original_receiver: receiver,
            current_sender: sender,
            current_receiver: receiver,
            nav: Duration::ZERO,
            created: now,
            arrival: None,
            packet_id,
            protocol,
            payload,
            required: None,
            path_delay: 0.0,
            faulty_link: None,
        }
    }

    /// Create a handshake frame (RTS/CTS/ACK) covering `data`'s exchange.
    /// The handshake frame inherits the data frame's packet id.
    pub fn handshake(
        kind: FrameKind,
        data: &LinkFrame,
        sender: NodeId,
        receiver: NodeId,
        nav: Duration,
        now: Timestamp,
    ) -> Self {
        debug_assert!(matches!(
            kind,
            FrameKind::Rts | FrameKind::Cts | FrameKind::Ack
        ));
        Self {
            kind,
            original_sender: sender,
            original_receiver: receiver,
            current_sender: sender,
            current_receiver: receiver,
            nav,
            created: now,
            arrival: None,
            packet_id: data.packet_id,
            protocol: data.protocol,
            payload: Vec::new(),
            required: None,
            path_delay: 0.0,
            faulty_link: None,
        }
    }

    /// Create a route request for `required`, originated by `originator`.
    pub fn route_request(
        packet_id: PacketId,
        originator: NodeId,
        next_hop: NodeId,
        required: NodeId,
        now: Timestamp,
    ) -> Self {
        let mut frame = Self::data(
            packet_id,
            originator,
            required,
            crate::constants::PROTO_ROUTING,
            Vec::new(),
            now,
        );
        frame.kind = FrameKind::RouteRequest;
        frame.current_receiver = next_hop;
        frame.required = Some(required);
        frame
    }

    /// Create a route reply answering a request for `required`.
    pub fn route_reply(
        packet_id: PacketId,
        responder: NodeId,
        requester: NodeId,
        required: NodeId,
        path_delay: f64,
        now: Timestamp,
    ) -> Self {
        let mut frame = Self::data(
            packet_id,
            responder,
            requester,
            crate::constants::PROTO_ROUTING,
            Vec::new(),
            now,
        );
        frame.kind = FrameKind::RouteReply;
        frame.required = Some(required);
        frame.path_delay = path_delay;
        frame
    }

    /// Create a route error reporting `faulty_link` on the way to
    /// `unreachable`. The error travels hop by hop (starting at
    /// `previous_hop`) back to `data_origin`, the sender that must restart
    /// discovery.
    pub fn route_error(
        packet_id: PacketId,
        reporter: NodeId,
        previous_hop: NodeId,
        data_origin: NodeId,
        unreachable: NodeId,
        faulty_link: (NodeId, NodeId),
        now: Timestamp,
    ) -> Self {
        let mut frame = Self::data(
            packet_id,
            reporter,
            data_origin,
            crate::constants::PROTO_ROUTING,
            Vec::new(),
            now,
        );
        frame.kind = FrameKind::RouteError;
        frame.current_receiver = previous_hop;
        frame.required = Some(unreachable);
        frame.faulty_link = Some(faulty_link);
        frame
    }

    /// The frame kind.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// The end-to-end sender, fixed at creation.
    pub fn original_sender(&self) -> NodeId {
        self.original_sender
    }

    /// The end-to-end receiver, fixed at creation.
    pub fn original_receiver(&self) -> NodeId {
        self.original_receiver
    }

    /// The sender of the current hop.
    pub fn current_sender(&self) -> NodeId {
        self.current_sender
    }

    /// The receiver of the current hop.
    pub fn current_receiver(&self) -> NodeId {
        self.current_receiver
    }

    /// Rewrite the current-hop endpoints; the only mutation a relay makes.
    pub fn set_current_hop(&mut self, sender: NodeId, receiver: NodeId) {
        self.current_sender = sender;
        self.current_receiver = receiver;
    }

    /// Rewrite only the current-hop receiver.
    pub fn set_current_receiver(&mut self, receiver: NodeId) {
        self.current_receiver = receiver;
    }

    /// Channel reservation advertised by this frame.
    pub fn nav(&self) -> Duration {
        self.nav
    }

    /// Set the channel reservation.
    pub fn set_nav(&mut self, nav: Duration) {
        self.nav = nav;
    }

    /// Creation time of the original packet.
    pub fn created(&self) -> Timestamp {
        self.created
    }

    /// Stamp the final-destination arrival time.
    pub fn set_arrival(&mut self, at: Timestamp) {
        self.arrival = Some(at);
    }

    /// End-to-end latency, if the frame has arrived.
    pub fn latency(&self) -> Option<Duration> {
        self.arrival.map(|at| at.duration_since(self.created))
    }

    /// Id of the original packet this frame belongs to.
    pub fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    /// Protocol number of the payload.
    pub fn protocol(&self) -> u16 {
        self.protocol
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Target address of a routing frame.
    pub fn required(&self) -> Option<NodeId> {
        self.required
    }

    /// Accumulated path delay of a route reply, in seconds.
    pub fn path_delay(&self) -> f64 {
        self.path_delay
    }

    /// The failed link reported by a route error.
    pub fn faulty_link(&self) -> Option<(NodeId, NodeId)> {
        self.faulty_link
    }

    /// Whether the current hop is a broadcast.
    pub fn is_broadcast(&self) -> bool {
        self.current_receiver.is_broadcast()
    }
}
