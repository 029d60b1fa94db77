//! `subnav-hal` – the simulator boundary.
//!
//! # Modules
//!
//! - [`simulator`] – the [`Simulator`][simulator::Simulator] trait the
//!   episode controller drives (`reset`, `step`, goal and shortest-path
//!   queries) and the [`StepResult`][simulator::StepResult] it returns.
//! - [`sim`] – [`KinematicSim`][sim::KinematicSim]: a deterministic planar
//!   simulator that renders the eight directional channels, for headless
//!   tests and CLI runs without a physics/rendering backend.

pub mod sim;
pub mod simulator;

pub use sim::{KinematicSim, SimConfig};
pub use simulator::{Simulator, StepResult};
