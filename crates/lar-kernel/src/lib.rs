//! `lar-kernel` – the map and its invariants.
//!
//! Owns the one piece of shared mutable state in a mapping session. It does
//! not schedule anything; it guarantees that every committed revision of
//! the map is whole and valid.
//!
//! # Modules
//!
//! - [`map`] – [`Map`][map::Map]: landmarks, anchors and the GPS log, mutated
//!   only through [`MapMutation`][map::MapMutation]s that are verified and
//!   then applied all-or-nothing, and read through cheap immutable
//!   [`MapSnapshot`][map::MapSnapshot]s.
//! - [`map_verifier`] – [`MapVerifier`][map_verifier::MapVerifier]: a rule
//!   engine that validates each proposed mutation against the map's
//!   invariants (GPS chronology, known identities, single origin, finite
//!   geometry) before it is applied.

pub mod map;
pub mod map_verifier;

pub use map::{Map, MapMutation, MapSnapshot, SnapshotSource, ORIGIN_ANCHOR_NAME};
pub use map_verifier::{
    AnchorNameRule, FiniteGeometryRule, GpsChronologyRule, KnownLandmarkRule, MapVerifier, Rule,
    SingleOriginRule,
};
