//! `subnav-metrics` – navigation-quality scoring.
//!
//! # Modules
//!
//! - [`engine`] – [`MetricsEngine`][engine::MetricsEngine]: per-episode
//!   distance-to-goal, path length, success, oracle success and SPL.
//! - [`aggregate`] – [`RunAggregate`][aggregate::RunAggregate]: averages of
//!   the final metrics over the completed episodes of a run.

pub mod aggregate;
pub mod engine;

pub use aggregate::RunAggregate;
pub use engine::{MetricsEngine, SUCCESS_RADIUS_M};
