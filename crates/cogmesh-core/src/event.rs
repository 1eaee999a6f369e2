//! Scheduled events
//!
//! Every state transition in the link layer is a callback dispatched by the
//! discrete-event [`Scheduler`](crate::scheduler::Scheduler) at a simulated
//! timestamp. The variants here are the complete set of callbacks: MAC
//! access steps, cluster timers, medium delivery, and scenario traffic.

use crate::frame::{LinkFrame, NodeId};

/// A step of a MAC interface's channel-access procedure.
///
/// Each step is armed by cancelling the interface's previous pending step,
/// so at most one of these is outstanding per interface at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacStep {
    /// DIFS sensing window ended; judge the medium.
    DifsDecision,
    /// SIFS + jitter elapsed; send RTS (unicast) or DATA (broadcast).
    Transmit,
    /// One backoff slot elapsed; decrement if it was sensed idle.
    BackoffSlotEnd,
    /// SIFS after an RTS; answer with CTS.
    SendCts,
    /// SIFS after a CTS; transmit the data frame.
    SendData,
    /// SIFS after a DATA; answer with ACK.
    SendAck,
    /// NAV or sensing window elapsed; resume queue processing.
    Resume,
    /// The awaited CTS/ACK never arrived; re-enter contention.
    ResponseTimeout,
}

/// A periodic timer of the cluster coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterTick {
    /// Broadcast the NCCI advertisement.
    Advertise,
    /// Rebuild neighbor tables and recompute fitness values.
    TableUpdate,
    /// Pick a cluster-head candidate and send CH_REQ.
    Candidacy,
    /// Evaluate CH_REQs / CH_ANMs and elect gateways.
    ClusterAge,
    /// Ask the MAC to pause for a spectrum-sensing window.
    SensingWindow,
}

/// An event in the discrete-event simulation.
#[derive(Debug, Clone)]
pub enum Event {
    /// A MAC access-procedure step fires on `node`.
    Mac { node: NodeId, step: MacStep },
    /// A cluster-coordinator timer fires on `node`.
    Cluster { node: NodeId, tick: ClusterTick },
    /// The medium starts delivering energy to `node`'s receiver.
    RxStart {
        node: NodeId,
        /// Received power at the listener, watts.
        power: f64,
    },
    /// A frame finishes arriving at `node`. `error` marks a reception the
    /// PHY could not decode (collision or noise).
    RxEnd {
        node: NodeId,
        frame: LinkFrame,
        power: f64,
        error: bool,
    },
    /// `node`'s PHY finished radiating `frame`.
    TxEnd { node: NodeId, frame: LinkFrame },
    /// Scenario traffic: `node` hands a payload to its routing unit.
    AppSend {
        node: NodeId,
        dest: NodeId,
        protocol: u16,
        payload: Vec<u8>,
    },
    /// Push a fresh channel-quality estimate into `node`'s coordinator.
    QualityUpdate {
        node: NodeId,
        qualities: Vec<(u16, f64)>,
    },
}
