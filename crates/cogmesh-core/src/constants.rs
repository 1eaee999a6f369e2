//! Link-layer protocol constants
//!
//! Inter-frame spacings follow the DCF timing grid; the byte sizes are the
//! wire budgets each frame kind must fit in (see `wire`).

use std::time::Duration;

/// Slot time of the backoff grid.
pub const SLOT: Duration = Duration::from_micros(9);
/// Short inter-frame space between handshake steps.
pub const SIFS: Duration = Duration::from_micros(16);
/// Distributed inter-frame space sensed before every access attempt.
pub const DIFS: Duration = Duration::from_micros(34);
/// Guard margin added to NAV reservations.
pub const MARGIN: Duration = Duration::from_micros(1);
/// Base wait for a CTS or ACK before the attempt re-enters contention.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_micros(55);

/// Upper bound of the random jitter inserted before an RTS or a broadcast
/// DATA, to break lockstep between interfaces that finished DIFS together.
pub const ACCESS_JITTER_MICROS: u64 = 8;

/// MAC header bytes counted into every frame's air time.
pub const MAC_HEADER_SIZE: u32 = 24;
/// PHY header bytes counted into every frame's air time.
pub const PHY_HEADER_SIZE: u32 = 24;

/// Wire budget for an RTS frame.
pub const RTS_SIZE: u32 = 44;
/// Wire budget for a CTS frame.
pub const CTS_SIZE: u32 = 38;
/// Wire budget for an ACK frame.
pub const ACK_SIZE: u32 = 38;
/// Wire budget for a neighbor/cluster connectivity broadcast.
pub const NCCI_SIZE: u32 = 500;
/// Wire budget for every other cluster or routing control message.
pub const CTRL_SIZE: u32 = 50;

/// Protocol number of the cluster-formation control plane.
pub const PROTO_CONTROL: u16 = 1000;
/// Protocol number of the routing plane.
pub const PROTO_ROUTING: u16 = 989;

/// Default carrier-sense energy threshold in watts.
pub const DEFAULT_CS_THRESHOLD: f64 = 1.2e-8;

/// Default contention-window exponent: backoff slots are drawn from
/// [1, 2^CW - 1].
pub const DEFAULT_CW_EXPONENT: u16 = 4;
