//! # Cognitive-Radio Clustered Mesh Link Layer
//!
//! This crate implements the control logic of a cognitive-radio mesh link
//! layer: deciding *when* to transmit, *who* leads a cluster, and *how* a
//! packet finds a multi-hop path. Three coupled protocols share one
//! discrete-event scheduler:
//!
//! - **MAC channel access** ([`mac`]): a DCF-style state machine whose
//!   carrier-sense decision integrates spectrum-sensing energy over DIFS
//!   and backoff slots, with an RTS/CTS/DATA/ACK handshake and NAV-based
//!   virtual carrier sensing.
//! - **Cluster formation** ([`cluster`]): fully distributed, periodic
//!   election of cluster heads and gateways from a fitness score computed
//!   over soft-state neighbor tables, assigning each cluster an active and
//!   a backup data channel.
//! - **Reactive routing** ([`routing`]): on-demand discovery through heads
//!   and gateways, with traffic buffered until a path is found.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Application                           │
//! └─────────────────────────────────────────────────────────────┘
//!               │ send_packet                   ▲ deliver
//! ┌─────────────▼───────────────┐   ┌──────────┴───────────────┐
//! │        RoutingUnit          │◄──│    ClusterCoordinator    │
//! │  table / pending / buffer   │   │  NCCI · V-score · CADC   │
//! └─────────────┬───────────────┘   └──────────┬───────────────┘
//!               │ enqueue                      │ channels, sensing
//! ┌─────────────▼──────────────────────────────▼───────────────┐
//! │                     MacChannelAccess                        │
//! │        DIFS sense · backoff · RTS/CTS/DATA/ACK · NAV        │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ Phy / EnergyMonitor traits
//! ┌─────────────────────────────▼───────────────────────────────┐
//! │                 PHY · energy model · estimator              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Execution is single-threaded cooperative scheduling: every state
//! transition is an [`event::Event`] fired by the [`scheduler::Scheduler`]
//! at a simulated timestamp, and every multi-step procedure cancels its
//! previous pending callback before arming the next one.
//!
//! ## Example
//!
//! ```rust
//! use cogmesh_core::sim::{Link, ScenarioConfig, Simulator, Topology};
//! use cogmesh_core::frame::NodeId;
//! use std::time::Duration;
//!
//! let ids: Vec<NodeId> = (1..=3).map(NodeId::from_u32).collect();
//! let topology = Topology::line(&ids, Link::default());
//! let mut sim = Simulator::new(ScenarioConfig::default().with_node_count(3), topology);
//!
//! sim.send_at(Duration::from_millis(50), ids[0], ids[1], 0x0800, b"hi".to_vec());
//! sim.run_for(Duration::from_millis(500));
//! println!("delivered: {}", sim.counters().packets_delivered);
//! ```

pub mod cluster;
pub mod config;
pub mod constants;
pub mod context;
pub mod event;
pub mod frame;
pub mod mac;
pub mod message;
pub mod node;
pub mod routing;
pub mod scheduler;
pub mod sim;
pub mod table;
pub mod time;
pub mod traits;
pub mod wire;

// Re-export main types
pub use cluster::{ClusterCoordinator, ClusterRole};
pub use config::{ClusterConfig, DataRate, MacConfig, RoutingConfig};
pub use context::{Counters, NetContext};
pub use event::{ClusterTick, Event, MacStep};
pub use frame::{FrameKind, LinkFrame, NodeId, PacketId};
pub use mac::{MacChannelAccess, MacState};
pub use message::{ControlKind, ControlMessage};
pub use node::{LinearEnergyModel, MeshNode};
pub use routing::{Delivery, RouteEntry, RoutingUnit};
pub use scheduler::{Scheduler, TimerHandle};
pub use table::TtlMap;
pub use time::Timestamp;
pub use traits::{EnergyMonitor, MacError, Phy, SpectrumEstimator};
