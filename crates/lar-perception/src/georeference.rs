//! Local ↔ geodetic georeferencing.
//!
//! The map frame is gravity-aligned but its heading and origin are
//! arbitrary, so a single GPS fix cannot place it on the globe. With two or
//! more [`GpsObservation`]s the [`Georeferencer`] fits a 2-D similarity
//! (rotation, uniform scale, translation) between the local horizontal
//! plane and a local East/North tangent plane anchored at the first
//! observation.
//!
//! # Fit
//!
//! Local points are projected to `u = (x, −z)`; geodetic points to
//! `e = (east, north)` metres. The fit minimises
//!
//! ```text
//! Σ wᵢ ‖ s·R(θ)·uᵢ + t − eᵢ ‖²      wᵢ = 1 / max(accuracyᵢ, 1 m)²
//! ```
//!
//! in closed form (weighted Umeyama). Two observations are matched exactly;
//! every further observation refines the estimate because the fit is
//! recomputed over the whole log whenever the log grows.
//!
//! # Hysteresis
//!
//! [`LocationFilter`] only surfaces a new user location once it has moved
//! more than a minimum distance from the last surfaced one, so a display
//! does not jitter with every pose sample.

use chrono::{DateTime, Utc};
use lar_types::{GeodeticPoint, GpsObservation};
use nalgebra::{Rotation2, Vector2, Vector3};
use tracing::debug;

/// Minimum number of observations before a fit is attempted.
pub const MIN_OBSERVATIONS: usize = 2;

/// Reported accuracy is floored to this value before weighting.
const MIN_ACCURACY_M: f64 = 1.0;

/// Weighted horizontal spread (m²) below which the local positions cannot
/// constrain rotation or scale.
const DEGENERATE_SPREAD_M2: f64 = 1e-4;

/// Default hysteresis distance for surfaced user locations.
pub const DEFAULT_MIN_DISPLACEMENT_M: f64 = 1.0;

// ────────────────────────────────────────────────────────────────────────────
// GeoFit
// ────────────────────────────────────────────────────────────────────────────

/// A fitted local → geodetic similarity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoFit {
    /// Tangent-plane origin (the first observation's coordinate).
    pub origin: GeodeticPoint,
    pub scale: f64,
    /// Counter-clockwise rotation from local `(x, −z)` to `(east, north)`.
    pub rotation_rad: f64,
    pub translation: Vector2<f64>,
    pub observations: usize,
    /// Weighted RMS residual of the fit, metres.
    pub rms_residual_m: f64,
}

impl GeoFit {
    /// Map a local position to geodetic coordinates. Height is ignored.
    pub fn global_point(&self, local: &Vector3<f64>) -> GeodeticPoint {
        let u = Vector2::new(local.x, -local.z);
        let en = self.scale * (Rotation2::new(self.rotation_rad) * u) + self.translation;
        from_tangent_plane(&self.origin, &en)
    }

    /// Map a geodetic coordinate to a local position at height `y`.
    pub fn local_point(&self, global: &GeodeticPoint, y: f64) -> Vector3<f64> {
        let en = to_tangent_plane(&self.origin, global);
        let u = Rotation2::new(-self.rotation_rad) * ((en - self.translation) / self.scale);
        Vector3::new(u.x, y, -u.y)
    }
}

/// Weighted least-squares similarity over `observations`.
///
/// Returns `None` with fewer than [`MIN_OBSERVATIONS`] entries, or when the
/// local positions are (nearly) coincident.
pub fn fit_similarity(observations: &[GpsObservation]) -> Option<GeoFit> {
    if observations.len() < MIN_OBSERVATIONS {
        return None;
    }
    let origin = observations[0].global;

    let samples: Vec<(Vector2<f64>, Vector2<f64>, f64)> = observations
        .iter()
        .map(|obs| {
            let u = Vector2::new(obs.relative.x, -obs.relative.z);
            let e = to_tangent_plane(&origin, &obs.global);
            let acc = obs.accuracy.max(MIN_ACCURACY_M);
            (u, e, 1.0 / (acc * acc))
        })
        .collect();

    let total_weight: f64 = samples.iter().map(|(_, _, w)| w).sum();
    let mean_u = samples.iter().map(|(u, _, w)| u * *w).sum::<Vector2<f64>>() / total_weight;
    let mean_e = samples.iter().map(|(_, e, w)| e * *w).sum::<Vector2<f64>>() / total_weight;

    let (mut dot, mut cross, mut spread) = (0.0, 0.0, 0.0);
    for (u, e, w) in &samples {
        let du = u - mean_u;
        let de = e - mean_e;
        dot += w * du.dot(&de);
        cross += w * (du.x * de.y - du.y * de.x);
        spread += w * du.norm_squared();
    }
    if spread / total_weight < DEGENERATE_SPREAD_M2 {
        debug!(observations = observations.len(), "georeference: degenerate spread");
        return None;
    }

    let rotation_rad = cross.atan2(dot);
    let scale = dot.hypot(cross) / spread;
    if !scale.is_finite() || scale <= f64::EPSILON {
        return None;
    }
    let rotation = Rotation2::new(rotation_rad);
    let translation = mean_e - scale * (rotation * mean_u);

    let residual: f64 = samples
        .iter()
        .map(|(u, e, w)| w * (scale * (rotation * u) + translation - e).norm_squared())
        .sum();

    Some(GeoFit {
        origin,
        scale,
        rotation_rad,
        translation,
        observations: observations.len(),
        rms_residual_m: (residual / total_weight).sqrt(),
    })
}

fn to_tangent_plane(origin: &GeodeticPoint, point: &GeodeticPoint) -> Vector2<f64> {
    let (east, north) = origin.enu_offset_to(point);
    Vector2::new(east, north)
}

fn from_tangent_plane(origin: &GeodeticPoint, en: &Vector2<f64>) -> GeodeticPoint {
    origin.offset_by(en.x, en.y)
}

// ────────────────────────────────────────────────────────────────────────────
// Georeferencer
// ────────────────────────────────────────────────────────────────────────────

/// Caches a [`GeoFit`] and refits when the observation log changes.
#[derive(Debug, Clone, Default)]
pub struct Georeferencer {
    fit: Option<GeoFit>,
    fitted_key: Option<(usize, DateTime<Utc>)>,
}

impl Georeferencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the fit up to date with `observations`.
    ///
    /// The log is append-only, so its length and newest timestamp identify
    /// it; an unchanged log is not refitted. Returns `true` if a fit is
    /// available afterwards.
    pub fn update(&mut self, observations: &[GpsObservation]) -> bool {
        let key = observations.last().map(|o| (observations.len(), o.timestamp));
        if key != self.fitted_key {
            self.fit = fit_similarity(observations);
            self.fitted_key = key;
            if let Some(fit) = &self.fit {
                debug!(
                    observations = fit.observations,
                    scale = fit.scale,
                    rms_m = fit.rms_residual_m,
                    "georeference refitted"
                );
            }
        }
        self.fit.is_some()
    }

    pub fn fit(&self) -> Option<&GeoFit> {
        self.fit.as_ref()
    }

    /// Geodetic coordinate of a local position, or `None` before two
    /// usable observations exist.
    pub fn global_point(&self, local: &Vector3<f64>) -> Option<GeodeticPoint> {
        self.fit.as_ref().map(|fit| fit.global_point(local))
    }

    /// Local position of a geodetic coordinate at height `y`.
    pub fn local_point(&self, global: &GeodeticPoint, y: f64) -> Option<Vector3<f64>> {
        self.fit.as_ref().map(|fit| fit.local_point(global, y))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Hysteresis
// ────────────────────────────────────────────────────────────────────────────

/// Suppresses location updates smaller than `min_displacement_m`.
#[derive(Debug, Clone)]
pub struct LocationFilter {
    min_displacement_m: f64,
    last: Option<GeodeticPoint>,
}

impl LocationFilter {
    pub fn new(min_displacement_m: f64) -> Self {
        Self {
            min_displacement_m: min_displacement_m.max(0.0),
            last: None,
        }
    }

    /// Returns `Some(candidate)` if it should be surfaced, remembering it as
    /// the new reference point.
    pub fn offer(&mut self, candidate: GeodeticPoint) -> Option<GeodeticPoint> {
        match self.last {
            Some(last) if last.distance_m(&candidate) <= self.min_displacement_m => None,
            _ => {
                self.last = Some(candidate);
                Some(candidate)
            }
        }
    }

    pub fn last_surfaced(&self) -> Option<GeodeticPoint> {
        self.last
    }
}

impl Default for LocationFilter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_DISPLACEMENT_M)
    }
}

/// Georeferencer plus hysteresis: turns device positions into the stream
/// of user locations a map display should show.
#[derive(Debug, Clone, Default)]
pub struct UserLocator {
    georeferencer: Georeferencer,
    filter: LocationFilter,
}

impl UserLocator {
    pub fn new(min_displacement_m: f64) -> Self {
        Self {
            georeferencer: Georeferencer::new(),
            filter: LocationFilter::new(min_displacement_m),
        }
    }

    /// Feed the current GPS log and device position; returns a location only
    /// when one should be surfaced.
    pub fn observe(
        &mut self,
        observations: &[GpsObservation],
        position: &Vector3<f64>,
    ) -> Option<GeodeticPoint> {
        if !self.georeferencer.update(observations) {
            return None;
        }
        let point = self.georeferencer.global_point(position)?;
        self.filter.offer(point)
    }

    pub fn last_surfaced(&self) -> Option<GeodeticPoint> {
        self.filter.last_surfaced()
    }
}
