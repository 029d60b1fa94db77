//! `subnav-perception` – turns raw simulator sensors into what the planner
//! reasons about.
//!
//! # Modules
//!
//! - [`aggregator`] – [`ObservationAggregator`][aggregator::ObservationAggregator]:
//!   gathers the eight directional frames of a decision point into an
//!   [`ObservationBundle`][aggregator::ObservationBundle] with a textual
//!   direction summary.
//! - [`compass`] – 3×3 compass composite of the eight frames and PNG
//!   encoding for diagnostic artifacts and request images.

pub mod aggregator;
pub mod compass;

pub use aggregator::{DirectionalFrame, ObservationAggregator, ObservationBundle};
pub use subnav_types::Direction;
