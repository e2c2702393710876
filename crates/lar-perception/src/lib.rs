//! `lar-perception` – geometry on top of the shared map.
//!
//! Pure, synchronous algorithms with no knowledge of tasks or storage. Each
//! works on plain slices of map data so callers can feed it a snapshot.
//!
//! # Modules
//!
//! - [`trajectory`] – [`Trajectory`][trajectory::Trajectory]: bounded,
//!   time-indexed pose history with linear interpolation.
//! - [`georeference`] – [`Georeferencer`][georeference::Georeferencer]:
//!   weighted least-squares fit between the local map frame and geodetic
//!   coordinates, plus the display hysteresis
//!   [`LocationFilter`][georeference::LocationFilter].
//! - [`prioritize`] – bounded, deterministic ranking of landmarks for
//!   presentation.
//! - [`alignment`] – closed-form and outlier-tolerant rigid alignment of
//!   3-D point correspondences.

pub mod alignment;
pub mod georeference;
pub mod prioritize;
pub mod trajectory;

pub use alignment::{RigidFit, RobustFitConfig, kabsch, robust_rigid_fit};
pub use georeference::{GeoFit, Georeferencer, LocationFilter, UserLocator};
pub use prioritize::{FULL_SORT_LIMIT, prioritize};
pub use trajectory::Trajectory;
