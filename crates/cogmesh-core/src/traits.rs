//! Collaborator interfaces
//!
//! The link layer drives three external collaborators: the PHY (transmit
//! and spectrum sensing), the energy model (residual-energy accounting for
//! the cluster fitness score), and the spectrum-quality estimator. They are
//! passed in as trait parameters wherever they are needed, so a mis-wired
//! node fails to compile instead of asserting at run time.

use crate::frame::LinkFrame;
use crate::time::Timestamp;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the MAC layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacError {
    /// The per-interface frame queue is at capacity; the frame was dropped.
    #[error("transmit queue full ({capacity} frames)")]
    QueueFull { capacity: usize },
}

/// Physical layer attached to one MAC interface.
pub trait Phy {
    /// Ask the PHY to radiate `frame`. Returns false if the PHY refuses
    /// (already busy); the refusal is reported, not fatal.
    fn start_tx(&mut self, frame: &LinkFrame) -> bool;

    /// Instantaneous sensed power on `channel`, in watts.
    fn carrier_sense(&mut self, channel: u16) -> f64;

    /// Retune the radio to `channel`.
    fn set_channel(&mut self, channel: u16);

    /// Abort an in-flight transmission (a sensing window preempted it).
    fn abort_tx(&mut self);
}

/// Per-device energy accounting.
///
/// The cluster layer reads the residual energy for its fitness score; the
/// MAC reports state changes so the model can drain by radio state.
pub trait EnergyMonitor {
    /// Residual energy, joules.
    fn remaining_energy(&self) -> f64;

    /// A transmission started at `now`.
    fn on_tx_start(&mut self, now: Timestamp);

    /// The transmission ended at `now`.
    fn on_tx_end(&mut self, now: Timestamp);

    /// A reception started at `now`.
    fn on_rx_start(&mut self, now: Timestamp);

    /// The reception ended at `now`.
    fn on_rx_end(&mut self, now: Timestamp);
}

/// The spectrum-quality estimator collaborator.
///
/// Quality maps arrive asynchronously as
/// [`Event::QualityUpdate`](crate::event::Event::QualityUpdate); the trait
/// only exposes what the coordinator must know synchronously — how long the
/// radio has to stay quiet for one sensing sweep.
pub trait SpectrumEstimator {
    /// Length of one full sensing sweep.
    fn sensing_window(&self) -> Duration;
}
