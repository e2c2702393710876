//! [`MapVerifier`] – invariant checks for proposed map mutations.
//!
//! [`Map::apply`](crate::Map::apply) passes every [`MapMutation`] through
//! [`MapVerifier::verify`] before touching any state. Every registered
//! [`Rule`] is evaluated in order; the first violation returns
//! [`LarError::Invariant`] and the mutation is **not** applied.
//!
//! Built-in rules (all registered by [`MapVerifier::standard`]):
//! - [`GpsChronologyRule`] – GPS observations strictly time-ordered.
//! - [`KnownLandmarkRule`] – landmark updates refer to existing, distinct ids.
//! - [`SingleOriginRule`] – anchor mutations keep exactly one map origin.
//! - [`FiniteGeometryRule`] – no NaN/∞ positions or transforms.
//! - [`AnchorNameRule`] – user anchors carry a non-empty name.

use std::collections::HashSet;

use lar_types::{LarError, Transform};
use nalgebra::Vector3;

use crate::map::{MapMutation, MapSnapshot};

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single map invariant that a mutation must preserve.
pub trait Rule: Send + Sync {
    /// Human-readable name used in error messages.
    fn name(&self) -> &str;

    /// Return `Ok(())` when applying `mutation` to `map` keeps the invariant.
    fn check(&self, map: &MapSnapshot, mutation: &MapMutation) -> Result<(), LarError>;
}

fn violation(rule: &dyn Rule, details: String) -> LarError {
    LarError::Invariant {
        rule: rule.name().to_string(),
        details,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MapVerifier
// ────────────────────────────────────────────────────────────────────────────

/// Rule engine evaluated before every map mutation.
///
/// # Example
///
/// ```
/// use lar_kernel::{Map, MapMutation, MapVerifier};
/// use lar_types::Transform;
///
/// let map = Map::new();
/// let verifier = MapVerifier::standard();
///
/// let blank = MapMutation::AddAnchor { name: " ".into(), transform: Transform::identity() };
/// assert!(verifier.verify(&map.snapshot(), &blank).is_err());
///
/// let named = MapMutation::AddAnchor { name: "door".into(), transform: Transform::identity() };
/// assert!(verifier.verify(&map.snapshot(), &named).is_ok());
/// ```
#[derive(Default)]
pub struct MapVerifier {
    rules: Vec<Box<dyn Rule>>,
}

impl MapVerifier {
    /// Create an empty verifier with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// A verifier with every built-in rule.
    pub fn standard() -> Self {
        let mut verifier = Self::new();
        verifier.add_rule(Box::new(FiniteGeometryRule));
        verifier.add_rule(Box::new(GpsChronologyRule));
        verifier.add_rule(Box::new(KnownLandmarkRule));
        verifier.add_rule(Box::new(SingleOriginRule));
        verifier.add_rule(Box::new(AnchorNameRule));
        verifier
    }

    /// Register a new [`Rule`]. Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Validate `mutation` against every rule, returning the first violation.
    pub fn verify(&self, map: &MapSnapshot, mutation: &MapMutation) -> Result<(), LarError> {
        for rule in &self.rules {
            rule.check(map, mutation)?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// New GPS observations must be strictly newer than the last logged one and
/// strictly increasing within the batch.
pub struct GpsChronologyRule;

impl Rule for GpsChronologyRule {
    fn name(&self) -> &str {
        "gps_chronology"
    }

    fn check(&self, map: &MapSnapshot, mutation: &MapMutation) -> Result<(), LarError> {
        let MapMutation::AppendGps(batch) = mutation else {
            return Ok(());
        };
        let mut last = map.gps_observations().last().map(|o| o.timestamp);
        for obs in batch {
            if let Some(prev) = last {
                if obs.timestamp <= prev {
                    return Err(violation(
                        self,
                        format!("observation at {} not after {}", obs.timestamp, prev),
                    ));
                }
            }
            last = Some(obs.timestamp);
        }
        Ok(())
    }
}

/// Landmark updates must target existing landmarks, each at most once.
pub struct KnownLandmarkRule;

impl Rule for KnownLandmarkRule {
    fn name(&self) -> &str {
        "known_landmark"
    }

    fn check(&self, map: &MapSnapshot, mutation: &MapMutation) -> Result<(), LarError> {
        let MapMutation::ApplyLandmarks(delta) = mutation else {
            return Ok(());
        };
        let mut seen = HashSet::with_capacity(delta.updated.len());
        for landmark in &delta.updated {
            if map.landmark(landmark.id).is_none() {
                return Err(violation(self, format!("unknown landmark {}", landmark.id)));
            }
            if !seen.insert(landmark.id) {
                return Err(violation(self, format!("landmark {} updated twice", landmark.id)));
            }
        }
        Ok(())
    }
}

/// Anchor mutations must start from, and leave, exactly one map origin.
pub struct SingleOriginRule;

impl Rule for SingleOriginRule {
    fn name(&self) -> &str {
        "single_origin"
    }

    fn check(&self, map: &MapSnapshot, mutation: &MapMutation) -> Result<(), LarError> {
        if !matches!(
            mutation,
            MapMutation::AddAnchor { .. } | MapMutation::ReplaceOrigin { .. }
        ) {
            return Ok(());
        }
        let origins = map.anchors().filter(|a| a.is_origin()).count();
        if origins != 1 {
            return Err(violation(
                self,
                format!("expected one map origin before {}, found {origins}", mutation.label()),
            ));
        }
        Ok(())
    }
}

/// Rejects non-finite coordinates anywhere in a mutation.
pub struct FiniteGeometryRule;

fn finite_vector(v: &Vector3<f64>) -> bool {
    v.iter().all(|c| c.is_finite())
}

fn finite_transform(t: &Transform) -> bool {
    finite_vector(&t.translation.vector) && t.rotation.coords.iter().all(|c| c.is_finite())
}

impl Rule for FiniteGeometryRule {
    fn name(&self) -> &str {
        "finite_geometry"
    }

    fn check(&self, _map: &MapSnapshot, mutation: &MapMutation) -> Result<(), LarError> {
        let ok = match mutation {
            MapMutation::ApplyLandmarks(delta) => {
                delta.created.iter().all(|l| finite_vector(&l.position))
                    && delta.updated.iter().all(|l| finite_vector(&l.position))
            }
            MapMutation::AppendGps(batch) => batch.iter().all(|o| {
                finite_vector(&o.relative)
                    && o.global.latitude.is_finite()
                    && o.global.longitude.is_finite()
            }),
            MapMutation::AddAnchor { transform, .. } | MapMutation::ReplaceOrigin { transform } => {
                finite_transform(transform)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(violation(self, format!("non-finite value in {}", mutation.label())))
        }
    }
}

/// User anchors need a non-blank name.
pub struct AnchorNameRule;

impl Rule for AnchorNameRule {
    fn name(&self) -> &str {
        "anchor_name"
    }

    fn check(&self, _map: &MapSnapshot, mutation: &MapMutation) -> Result<(), LarError> {
        match mutation {
            MapMutation::AddAnchor { name, .. } if name.trim().is_empty() => {
                Err(violation(self, "anchor name is blank".to_string()))
            }
            _ => Ok(()),
        }
    }
}
