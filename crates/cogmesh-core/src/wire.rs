//! Wire encoding
//!
//! Explicit big-endian framing for link frames and cluster control
//! messages. Every encodable kind has a byte budget (`constants`); frames
//! are padded up to their budget so modeled air time matches the encoded
//! size, and an encoding that would overflow its budget is an error rather
//! than a silent truncation.
//!
//! ## Link frame layout
//!
//! ```text
//! ┌──────┬─────────────────────────────┬─────────┬───────────┬──────────┐
//! │ kind │ orig-src orig-dst cur-src   │ NAV µs  │ packet id │ protocol │
//! │ (1B) │ cur-dst         (4 × 4B)    │ (4B)    │ (8B)      │ (2B)     │
//! └──────┴─────────────────────────────┴─────────┴───────────┴──────────┘
//! ```
//!
//! followed by kind-specific fields: required address (4B) for routing
//! frames, path delay (f32, 4B) for replies/errors, faulty link (8B) for
//! errors, and a length-prefixed payload for data frames.

use crate::constants::{ACK_SIZE, CTRL_SIZE, CTS_SIZE, NCCI_SIZE, RTS_SIZE};
use crate::frame::{FrameKind, LinkFrame, NodeId, PacketId};
use crate::message::{ControlKind, ControlMessage};
use crate::time::Timestamp;
use thiserror::Error;

/// Errors surfaced while encoding or decoding wire bytes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WireError {
    /// Input ended before the structure was complete.
    #[error("truncated input: needed {needed} bytes, had {had}")]
    Truncated { needed: usize, had: usize },
    /// Unknown frame or message kind byte.
    #[error("unrecognized kind byte {0:#04x}")]
    BadKind(u8),
    /// The encoding exceeded the kind's byte budget.
    #[error("encoded {kind} is {size} bytes, over its {budget} byte budget")]
    OverBudget {
        kind: &'static str,
        size: usize,
        budget: usize,
    },
}

/// The byte budget for a frame kind, if it has one.
///
/// Data frames have no fixed budget; their air size is header plus payload.
pub fn frame_budget(kind: FrameKind) -> Option<usize> {
    match kind {
        FrameKind::Rts => Some(RTS_SIZE as usize),
        FrameKind::Cts => Some(CTS_SIZE as usize),
        FrameKind::Ack => Some(ACK_SIZE as usize),
        FrameKind::RouteRequest | FrameKind::RouteReply | FrameKind::RouteError => {
            Some(CTRL_SIZE as usize)
        }
        FrameKind::Data => None,
    }
}

/// The byte budget for a control message kind.
pub fn message_budget(kind: ControlKind) -> usize {
    match kind {
        ControlKind::Ncci => NCCI_SIZE as usize,
        _ => CTRL_SIZE as usize,
    }
}

/// Total on-air bytes of a frame: its wire budget (or encoded size for
/// data frames) plus the MAC and PHY headers.
pub fn frame_air_bytes(frame: &LinkFrame) -> u32 {
    let wire_bytes = match frame_budget(frame.kind()) {
        Some(budget) => budget as u32,
        None => FRAME_HEADER_SIZE + 2 + frame.payload().len() as u32,
    };
    wire_bytes + crate::constants::MAC_HEADER_SIZE + crate::constants::PHY_HEADER_SIZE
}

/// Bytes of the fixed link-frame header.
pub const FRAME_HEADER_SIZE: u32 = 31;

fn frame_kind_byte(kind: FrameKind) -> u8 {
    match kind {
        FrameKind::Rts => 0,
        FrameKind::Cts => 1,
        FrameKind::Data => 2,
        FrameKind::Ack => 3,
        FrameKind::RouteRequest => 4,
        FrameKind::RouteReply => 5,
        FrameKind::RouteError => 6,
    }
}

fn frame_kind_from_byte(byte: u8) -> Result<FrameKind, WireError> {
    Ok(match byte {
        0 => FrameKind::Rts,
        1 => FrameKind::Cts,
        2 => FrameKind::Data,
        3 => FrameKind::Ack,
        4 => FrameKind::RouteRequest,
        5 => FrameKind::RouteReply,
        6 => FrameKind::RouteError,
        other => return Err(WireError::BadKind(other)),
    })
}

fn message_kind_byte(kind: ControlKind) -> u8 {
    match kind {
        ControlKind::Ncci => 0,
        ControlKind::HeadAnnounce => 1,
        ControlKind::HeadRequest => 2,
        ControlKind::JoinRequest => 3,
        ControlKind::GatewayAnnounce => 4,
    }
}

fn message_kind_from_byte(byte: u8) -> Result<ControlKind, WireError> {
    Ok(match byte {
        0 => ControlKind::Ncci,
        1 => ControlKind::HeadAnnounce,
        2 => ControlKind::HeadRequest,
        3 => ControlKind::JoinRequest,
        4 => ControlKind::GatewayAnnounce,
        other => return Err(WireError::BadKind(other)),
    })
}

/// Cursor over input bytes for decoding.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.bytes.len() {
            return Err(WireError::Truncated {
                needed: self.pos + n,
                had: self.bytes.len(),
            });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn f32(&mut self) -> Result<f32, WireError> {
        let b = self.take(4)?;
        Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64, WireError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(f64::from_be_bytes(arr))
    }

    fn node_id(&mut self) -> Result<NodeId, WireError> {
        let b = self.take(4)?;
        Ok(NodeId::from_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Encode a link frame, padded up to its kind's budget.
pub fn encode_frame(frame: &LinkFrame) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(64);
    out.push(frame_kind_byte(frame.kind()));
    out.extend_from_slice(frame.original_sender().as_bytes());
    out.extend_from_slice(frame.original_receiver().as_bytes());
    out.extend_from_slice(frame.current_sender().as_bytes());
    out.extend_from_slice(frame.current_receiver().as_bytes());
    out.extend_from_slice(&(frame.nav().as_micros() as u32).to_be_bytes());
    out.extend_from_slice(&frame.packet_id().0.to_be_bytes());
    out.extend_from_slice(&frame.protocol().to_be_bytes());

    match frame.kind() {
        FrameKind::Rts | FrameKind::Cts | FrameKind::Ack => {}
        FrameKind::RouteRequest => {
            out.extend_from_slice(frame.required().unwrap_or(NodeId::UNSPECIFIED).as_bytes());
        }
        FrameKind::RouteReply => {
            out.extend_from_slice(frame.required().unwrap_or(NodeId::UNSPECIFIED).as_bytes());
            out.extend_from_slice(&(frame.path_delay() as f32).to_be_bytes());
        }
        FrameKind::RouteError => {
            out.extend_from_slice(frame.required().unwrap_or(NodeId::UNSPECIFIED).as_bytes());
            out.extend_from_slice(&(frame.path_delay() as f32).to_be_bytes());
            let (up, down) = frame
                .faulty_link()
                .unwrap_or((NodeId::UNSPECIFIED, NodeId::UNSPECIFIED));
            out.extend_from_slice(up.as_bytes());
            out.extend_from_slice(down.as_bytes());
        }
        FrameKind::Data => {
            out.extend_from_slice(&(frame.payload().len() as u16).to_be_bytes());
            out.extend_from_slice(frame.payload());
        }
    }

    if let Some(budget) = frame_budget(frame.kind()) {
        if out.len() > budget {
            return Err(WireError::OverBudget {
                kind: "frame",
                size: out.len(),
                budget,
            });
        }
        out.resize(budget, 0);
    }
    Ok(out)
}

/// Decode a link frame. Budget padding past the structure is ignored.
pub fn decode_frame(bytes: &[u8], now: Timestamp) -> Result<LinkFrame, WireError> {
    let mut r = Reader::new(bytes);
    let kind = frame_kind_from_byte(r.u8()?)?;
    let original_sender = r.node_id()?;
    let original_receiver = r.node_id()?;
    let current_sender = r.node_id()?;
    let current_receiver = r.node_id()?;
    let nav = std::time::Duration::from_micros(r.u32()? as u64);
    let packet_id = PacketId(r.u64()?);
    let protocol = r.u16()?;

    let mut frame = match kind {
        FrameKind::Data => {
            let len = r.u16()? as usize;
            let payload = r.take(len)?.to_vec();
            LinkFrame::data(
                packet_id,
                original_sender,
                original_receiver,
                protocol,
                payload,
                now,
            )
        }
        FrameKind::Rts | FrameKind::Cts | FrameKind::Ack => {
            let data = LinkFrame::data(
                packet_id,
                original_sender,
                original_receiver,
                protocol,
                Vec::new(),
                now,
            );
            LinkFrame::handshake(kind, &data, original_sender, original_receiver, nav, now)
        }
        FrameKind::RouteRequest => {
            let required = r.node_id()?;
            LinkFrame::route_request(packet_id, original_sender, current_receiver, required, now)
        }
        FrameKind::RouteReply => {
            let required = r.node_id()?;
            let delay = r.f32()? as f64;
            LinkFrame::route_reply(
                packet_id,
                original_sender,
                original_receiver,
                required,
                delay,
                now,
            )
        }
        FrameKind::RouteError => {
            let required = r.node_id()?;
            let _delay = r.f32()?;
            let up = r.node_id()?;
            let down = r.node_id()?;
            LinkFrame::route_error(
                packet_id,
                original_sender,
                current_receiver,
                original_receiver,
                required,
                (up, down),
                now,
            )
        }
    };
    frame.set_current_hop(current_sender, current_receiver);
    frame.set_nav(nav);
    Ok(frame)
}

/// Encode a control message, padded up to its kind's budget.
pub fn encode_message(msg: &ControlMessage) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(message_budget(msg.kind()));
    out.push(message_kind_byte(msg.kind()));
    out.extend_from_slice(msg.source().as_bytes());
    out.extend_from_slice(msg.destination().as_bytes());
    out.extend_from_slice(&msg.packet_id().0.to_be_bytes());
    out.extend_from_slice(&(msg.created().as_micros()).to_be_bytes());
    out.extend_from_slice(&msg.energy().to_be_bytes());
    out.extend_from_slice(&msg.cadc().to_be_bytes());
    out.extend_from_slice(&msg.cbdc().to_be_bytes());
    out.extend_from_slice(&msg.origin_node().to_be_bytes());

    out.extend_from_slice(&(msg.channel_quality().len() as u16).to_be_bytes());
    for (channel, quality) in msg.channel_quality() {
        out.extend_from_slice(&channel.to_be_bytes());
        out.extend_from_slice(&quality.to_be_bytes());
    }

    out.extend_from_slice(&(msg.neighbor_connectivity().len() as u16).to_be_bytes());
    for (neighbor, channels) in msg.neighbor_connectivity() {
        out.extend_from_slice(neighbor.as_bytes());
        out.push(channels.len() as u8);
        for channel in channels {
            out.extend_from_slice(&channel.to_be_bytes());
        }
    }

    out.extend_from_slice(&(msg.cluster_reachability().len() as u16).to_be_bytes());
    for (head, (cadc, cbdc)) in msg.cluster_reachability() {
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&cadc.to_be_bytes());
        out.extend_from_slice(&cbdc.to_be_bytes());
    }

    let budget = message_budget(msg.kind());
    if out.len() > budget {
        return Err(WireError::OverBudget {
            kind: "control message",
            size: out.len(),
            budget,
        });
    }
    out.resize(budget, 0);
    Ok(out)
}

/// Decode a control message.
pub fn decode_message(bytes: &[u8]) -> Result<ControlMessage, WireError> {
    let mut r = Reader::new(bytes);
    let kind = message_kind_from_byte(r.u8()?)?;
    let source = r.node_id()?;
    let destination = r.node_id()?;
    let packet_id = PacketId(r.u64()?);
    let created = Timestamp::from_micros(r.u64()?);
    let energy = r.f64()?;
    let cadc = r.u16()?;
    let cbdc = r.u16()?;
    let origin = r.u32()?;

    let mut quality = crate::message::ChannelQuality::new();
    for _ in 0..r.u16()? {
        let channel = r.u16()?;
        let q = r.f64()?;
        quality.insert(channel, q);
    }

    let mut connectivity = crate::message::NeighborConnectivity::new();
    for _ in 0..r.u16()? {
        let neighbor = r.node_id()?;
        let count = r.u8()?;
        let mut channels = std::collections::BTreeSet::new();
        for _ in 0..count {
            channels.insert(r.u16()?);
        }
        connectivity.insert(neighbor, channels);
    }

    let mut reachability = crate::message::ClusterReachability::new();
    for _ in 0..r.u16()? {
        let head = r.node_id()?;
        let a = r.u16()?;
        let b = r.u16()?;
        reachability.insert(head, (a, b));
    }

    Ok(ControlMessage::new(kind, packet_id, source, destination, created)
        .with_channel_quality(quality)
        .with_neighbor_connectivity(connectivity)
        .with_cluster_reachability(reachability)
        .with_energy(energy)
        .with_data_channels(cadc, cbdc)
        .with_origin_node(origin))
}
