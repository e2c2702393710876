//! The map-builder seam.
//!
//! A [`MapBuilder`] turns frames into landmark proposals. It never touches
//! the [`Map`](lar_kernel::Map): every call receives the latest committed
//! [`MapSnapshot`] and returns a [`LandmarkDelta`] that the live mapper's
//! writer commits (or rejects) atomically. A builder that fails or panics
//! therefore cannot leave the map half-written.
//!
//! [`DescriptorMapBuilder`] is the reference implementation used by the CLI
//! and the tests. It associates depth-backed features with existing
//! landmarks by descriptor distance and proximity, and its `process` pass
//! promotes landmarks with enough supporting observations to usable.

use std::collections::HashSet;

use lar_kernel::MapSnapshot;
use lar_types::{
    Descriptor, Frame, Landmark, LandmarkDelta, LandmarkId, LarError, NewLandmark, PoseSample,
};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Reasons a builder rejects its input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuilderError {
    #[error("frame has {found} features, at least {required} required")]
    InsufficientFeatures { found: usize, required: usize },
    #[error("frame camera pose is not finite")]
    InvalidPose,
}

impl From<BuilderError> for LarError {
    fn from(err: BuilderError) -> Self {
        LarError::Builder(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

/// External SLAM capability driven by the live mapper's builder lane.
///
/// Calls are strictly sequential; `add_frame` and `process` may be slow and
/// are run on a blocking thread.
pub trait MapBuilder: Send + 'static {
    /// Ingest a frame and propose created/updated landmarks.
    fn add_frame(&mut self, map: &MapSnapshot, frame: &Frame) -> Result<LandmarkDelta, BuilderError>;

    /// Cheap, high-frequency pose sample.
    fn add_position(&mut self, sample: &PoseSample);

    /// One optimization pass over the committed landmarks.
    fn process(&mut self, map: &MapSnapshot) -> Result<LandmarkDelta, BuilderError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Reference builder
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning for [`DescriptorMapBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Frames with fewer features are rejected.
    pub min_features: usize,
    /// Largest Hamming distance accepted as the same landmark.
    pub max_descriptor_distance: u32,
    /// Largest distance (metres) between a feature and the landmark it
    /// updates.
    pub match_radius_m: f64,
    /// Supporting frames needed before a landmark is usable.
    pub min_observations: u32,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            min_features: 6,
            max_descriptor_distance: 24,
            match_radius_m: 0.3,
            min_observations: 2,
        }
    }
}

/// Descriptor-matching reference builder.
#[derive(Debug, Clone, Default)]
pub struct DescriptorMapBuilder {
    config: BuilderConfig,
    positions_seen: u64,
    last_position: Option<PoseSample>,
}

impl DescriptorMapBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            config,
            positions_seen: 0,
            last_position: None,
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Number of pose samples received so far.
    pub fn positions_seen(&self) -> u64 {
        self.positions_seen
    }

    pub fn last_position(&self) -> Option<&PoseSample> {
        self.last_position.as_ref()
    }

    /// Closest unclaimed landmark that passes both the descriptor and the
    /// radius gate.
    fn best_match<'a>(
        &self,
        map: &'a MapSnapshot,
        claimed: &HashSet<LandmarkId>,
        descriptor: &Descriptor,
        world: &Vector3<f64>,
    ) -> Option<&'a Landmark> {
        map.landmarks()
            .filter(|l| !claimed.contains(&l.id))
            .filter(|l| (l.position - world).norm() <= self.config.match_radius_m)
            .map(|l| (l.descriptor.distance(descriptor), l))
            .filter(|(d, _)| *d <= self.config.max_descriptor_distance)
            .min_by_key(|(d, l)| (*d, l.id))
            .map(|(_, l)| l)
    }
}

impl MapBuilder for DescriptorMapBuilder {
    fn add_frame(&mut self, map: &MapSnapshot, frame: &Frame) -> Result<LandmarkDelta, BuilderError> {
        if frame.features.len() < self.config.min_features {
            return Err(BuilderError::InsufficientFeatures {
                found: frame.features.len(),
                required: self.config.min_features,
            });
        }
        let camera = frame.camera_pose.translation.vector;
        if !camera.iter().all(|v| v.is_finite())
            || !frame.camera_pose.rotation.coords.iter().all(|v| v.is_finite())
        {
            return Err(BuilderError::InvalidPose);
        }

        let mut delta = LandmarkDelta::default();
        let mut claimed = HashSet::new();

        for feature in &frame.features {
            let world = (frame.camera_pose * Point3::from(feature.point)).coords;
            if !world.iter().all(|v| v.is_finite()) {
                continue;
            }

            match self.best_match(map, &claimed, &feature.descriptor, &world) {
                Some(existing) => {
                    claimed.insert(existing.id);
                    let n = existing.observations as f64;
                    let mut updated = existing.clone();
                    updated.position = (existing.position * n + world) / (n + 1.0);
                    updated.observations += 1;
                    if frame.timestamp > updated.last_seen {
                        updated.last_seen = frame.timestamp;
                    }
                    delta.updated.push(updated);
                }
                None => {
                    let view = camera - world;
                    delta.created.push(NewLandmark {
                        position: world,
                        orientation: view.try_normalize(f64::EPSILON),
                        descriptor: feature.descriptor,
                        observations: 1,
                        last_seen: frame.timestamp,
                        is_usable: false,
                    });
                }
            }
        }

        debug!(
            features = frame.features.len(),
            created = delta.created.len(),
            updated = delta.updated.len(),
            "frame associated"
        );
        Ok(delta)
    }

    fn add_position(&mut self, sample: &PoseSample) {
        self.positions_seen += 1;
        self.last_position = Some(*sample);
    }

    fn process(&mut self, map: &MapSnapshot) -> Result<LandmarkDelta, BuilderError> {
        let updated: Vec<Landmark> = map
            .landmarks()
            .filter(|l| (l.observations >= self.config.min_observations) != l.is_usable)
            .map(|l| Landmark {
                is_usable: !l.is_usable,
                ..l.clone()
            })
            .collect();
        debug!(
            landmarks = map.landmark_count(),
            changed = updated.len(),
            "optimization pass"
        );
        Ok(LandmarkDelta {
            created: Vec::new(),
            updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use lar_kernel::{Map, MapMutation};
    use lar_types::{Feature, Transform};
    use nalgebra::{Translation3, UnitQuaternion};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    /// Feature for seed `k` placed at world `(k, 1, −5)`, seen from `camera`.
    fn frame(seeds: &[u64], camera: Vector3<f64>, at: i64) -> Frame {
        let pose = Transform::from_parts(Translation3::from(camera), UnitQuaternion::identity());
        Frame {
            timestamp: t(at),
            camera_pose: pose,
            features: seeds
                .iter()
                .map(|&k| Feature {
                    descriptor: Descriptor::from_seed(k).perturbed((k % 3) as usize),
                    point: Vector3::new(k as f64, 1.0, -5.0) - camera,
                })
                .collect(),
            image: None,
        }
    }

    fn commit(map: &mut Map, delta: LandmarkDelta) {
        map.apply(MapMutation::ApplyLandmarks(delta)).unwrap();
    }

    #[test]
    fn first_frame_creates_landmarks() {
        let map = Map::new();
        let mut builder = DescriptorMapBuilder::default();
        let delta = builder
            .add_frame(&map.snapshot(), &frame(&[1, 2, 3, 4, 5, 6], Vector3::zeros(), 0))
            .unwrap();
        assert_eq!(delta.created.len(), 6);
        assert!(delta.updated.is_empty());
        assert!(delta.created.iter().all(|l| !l.is_usable && l.observations == 1));
        let orientation = delta.created[0].orientation.unwrap();
        assert!((orientation.norm() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn repeated_features_update_in_place() {
        let mut map = Map::new();
        let mut builder = DescriptorMapBuilder::default();
        let first = builder
            .add_frame(&map.snapshot(), &frame(&[1, 2, 3, 4, 5, 6], Vector3::zeros(), 0))
            .unwrap();
        commit(&mut map, first);

        let second = builder
            .add_frame(
                &map.snapshot(),
                &frame(&[1, 2, 3, 4, 5, 6, 7], Vector3::new(0.5, 0.0, 0.0), 1),
            )
            .unwrap();
        assert_eq!(second.updated.len(), 6);
        assert_eq!(second.created.len(), 1);
        for landmark in &second.updated {
            assert_eq!(landmark.observations, 2);
            assert_eq!(landmark.last_seen, t(1));
            let k = (landmark.position.x).round();
            assert!((landmark.position - Vector3::new(k, 1.0, -5.0)).norm() < 1e-9);
        }
    }

    #[test]
    fn sparse_frame_is_rejected() {
        let map = Map::new();
        let mut builder = DescriptorMapBuilder::default();
        let err = builder
            .add_frame(&map.snapshot(), &frame(&[1, 2], Vector3::zeros(), 0))
            .unwrap_err();
        assert_eq!(
            err,
            BuilderError::InsufficientFeatures {
                found: 2,
                required: 6
            }
        );
    }

    #[test]
    fn non_finite_pose_is_rejected() {
        let map = Map::new();
        let mut builder = DescriptorMapBuilder::default();
        let mut bad = frame(&[1, 2, 3, 4, 5, 6], Vector3::zeros(), 0);
        bad.camera_pose.translation.vector.x = f64::NAN;
        assert_eq!(
            builder.add_frame(&map.snapshot(), &bad).unwrap_err(),
            BuilderError::InvalidPose
        );
    }

    #[test]
    fn process_is_idempotent() {
        let mut map = Map::new();
        let mut builder = DescriptorMapBuilder::default();
        let a = builder
            .add_frame(&map.snapshot(), &frame(&[1, 2, 3, 4, 5, 6, 7], Vector3::zeros(), 0))
            .unwrap();
        commit(&mut map, a);
        let b = builder
            .add_frame(&map.snapshot(), &frame(&[1, 2, 3, 8, 9, 10], Vector3::zeros(), 1))
            .unwrap();
        commit(&mut map, b);

        let pass = builder.process(&map.snapshot()).unwrap();
        assert_eq!(pass.updated.len(), 3);
        commit(&mut map, pass);
        assert_eq!(map.snapshot().usable_landmark_count(), 3);

        assert!(builder.process(&map.snapshot()).unwrap().is_empty());
    }

    #[test]
    fn positions_are_tracked() {
        let mut builder = DescriptorMapBuilder::default();
        builder.add_position(&PoseSample {
            position: Vector3::new(1.0, 2.0, 3.0),
            timestamp: t(4),
        });
        assert_eq!(builder.positions_seen(), 1);
        assert_eq!(builder.last_position().unwrap().timestamp, t(4));
    }
}
