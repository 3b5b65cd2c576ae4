//! # CubeSat Virtual Testbed Kernel
//!
//! The heartbeat of a satellite simulation: a fixed-rate tick loop that
//! advances simulated time, recomputes the satellite state and streams it to
//! every connected observer in real time.
//!
//! ## Features
//!
//! - **Drift-free scheduling**: each deadline is the previous target plus one
//!   tick, so slow ticks never shift the schedule
//! - **Time warp**: simulated time advances `time_warp_factor` times faster
//!   than wall time
//! - **Fault containment**: a failing or panicking position provider raises a
//!   CRITICAL alert for that tick and the loop keeps going
//! - **Fan-out**: one serialization per tick, concurrent delivery, and
//!   eviction of observers that fail or stall
//!
//! ## Quick Start
//!
//! ```no_run
//! use cvt::config::CvtConfig;
//! use cvt::testbed::Testbed;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CvtConfig::load(None)?;
//! let testbed = Testbed::from_config(&config)?;
//! testbed.listen(&config.server.bind_addr()).await?;
//! testbed.start().await;
//! // ... later
//! testbed.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`kernel`] - tick scheduler and status accessor
//! - [`broadcast`] - per-tick fan-out to observers
//! - [`registry`] - lock-protected set of live connections
//! - [`state`] - the broadcast snapshot and alerts
//! - [`propagator`] - position provider contract and implementations
//! - [`transport`] - TCP observer transport
//! - [`protocol`] - observer request/response lines
//! - [`config`] - layered configuration and validation
//! - [`testbed`] - composition root

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod broadcast;
pub mod config;
pub mod kernel;
pub mod logging;
pub mod propagator;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod testbed;
pub mod transport;

// Re-export main public types for convenience
pub use broadcast::{BroadcastReport, Broadcaster};
pub use config::{CvtConfig, KernelConfig};
pub use kernel::{KernelPhase, KernelStatus, SimulationKernel};
pub use propagator::{PositionProvider, StateVector};
pub use registry::{Connection, ConnectionId, ConnectionRegistry};
pub use state::{Alert, AlertLevel, SatelliteState};
pub use testbed::Testbed;
