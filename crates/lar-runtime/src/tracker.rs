//! Localization against a frozen map.
//!
//! A [`Tracker`] is built from one [`MapSnapshot`] (or a saved map) and
//! never sees later mutation. [`Tracker::localize`] is `&self`-only: it
//! matches frame features to usable landmarks by descriptor (nearest
//! neighbour with a ratio test), then estimates the camera → map transform
//! with an outlier-tolerant rigid fit of the feature points (camera frame)
//! onto the landmark positions (map frame).
//!
//! A tracker is either **unbound** ([`Tracker::default`], every query
//! fails) or **bound** to a map. Rebinding means building a new tracker.
//!
//! # Relocalization
//!
//! Given a successful [`Localization`] (`T_map_cam`) and the camera pose the
//! device reports in its current tracking frame (`T_track_cam`),
//! [`origin_in_tracking_frame`] returns
//!
//! ```text
//! T_track_map = T_track_cam · T_map_cam⁻¹
//! ```
//!
//! which is where the map origin anchor belongs in the new session.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use lar_kernel::{Map, MapSnapshot};
use lar_perception::{RobustFitConfig, robust_rigid_fit};
use lar_types::{Frame, Landmark, LandmarkId, LarError, Transform};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Tuning for [`Tracker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Largest Hamming distance accepted for a match.
    pub max_descriptor_distance: u32,
    /// Best match must be closer than `ratio` × second best.
    pub ratio: f64,
    /// Fewer descriptor matches than this fail immediately.
    pub min_matches: usize,
    pub inlier_threshold_m: f64,
    pub min_inliers: usize,
    pub max_iterations: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_descriptor_distance: 32,
            ratio: 0.8,
            min_matches: 8,
            inlier_threshold_m: 0.05,
            min_inliers: 6,
            max_iterations: 12,
        }
    }
}

/// A successful localization.
#[derive(Debug, Clone, PartialEq)]
pub struct Localization {
    /// Camera → map transform (`T_map_cam`).
    pub transform: Transform,
    /// Landmarks supporting the final fit.
    pub matched: Vec<LandmarkId>,
    /// Descriptor matches before outlier rejection.
    pub matches: usize,
    pub inliers: usize,
    pub rms_error_m: f64,
}

/// Where the map origin sits in the device's current tracking frame.
pub fn origin_in_tracking_frame(localization: &Localization, camera_pose: &Transform) -> Transform {
    camera_pose * localization.transform.inverse()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracker
// ─────────────────────────────────────────────────────────────────────────────

/// Localization query engine over a frozen map.
#[derive(Debug, Clone, Default)]
pub struct Tracker {
    map: Option<MapSnapshot>,
    usable: Vec<Landmark>,
    config: TrackerConfig,
}

impl Tracker {
    /// Bind a tracker to `map`.
    pub fn new(map: MapSnapshot, config: TrackerConfig) -> Self {
        let usable: Vec<Landmark> = map.landmarks().filter(|l| l.is_usable).cloned().collect();
        info!(
            revision = map.revision(),
            landmarks = map.landmark_count(),
            usable = usable.len(),
            "tracker bound"
        );
        Self {
            map: Some(map),
            usable,
            config,
        }
    }

    /// Bind a tracker to a saved map (session directory or map file).
    pub fn load(path: &Path, config: TrackerConfig) -> Result<Self, LarError> {
        let archive = lar_store::load_archive(path).map_err(|e| e.into_lar("load_map"))?;
        let map = Map::from_archive(archive)?;
        Ok(Self::new(map.snapshot(), config))
    }

    pub fn is_bound(&self) -> bool {
        self.map.is_some()
    }

    pub fn map(&self) -> Option<&MapSnapshot> {
        self.map.as_ref()
    }

    pub fn usable_landmark_count(&self) -> usize {
        self.usable.len()
    }

    /// Place `frame` inside the bound map. `None` on any failure.
    pub fn localize(&self, frame: &Frame) -> Option<Localization> {
        if self.usable.is_empty() {
            return None;
        }

        // Best feature per landmark: landmark index → (feature index, distance).
        let mut best: HashMap<usize, (usize, u32)> = HashMap::new();
        for (fi, feature) in frame.features.iter().enumerate() {
            let mut first: Option<(usize, u32)> = None;
            let mut second: Option<u32> = None;
            for (li, landmark) in self.usable.iter().enumerate() {
                let d = landmark.descriptor.distance(&feature.descriptor);
                match first {
                    Some((_, fd)) if d >= fd => {
                        if second.is_none_or(|sd| d < sd) {
                            second = Some(d);
                        }
                    }
                    _ => {
                        second = first.map(|(_, fd)| fd);
                        first = Some((li, d));
                    }
                }
            }
            let Some((li, d)) = first else { continue };
            if d > self.config.max_descriptor_distance {
                continue;
            }
            if second.is_some_and(|sd| d as f64 >= self.config.ratio * sd as f64) {
                continue;
            }
            match best.get(&li) {
                Some(&(_, prev)) if prev <= d => {}
                _ => {
                    best.insert(li, (fi, d));
                }
            }
        }

        if best.len() < self.config.min_matches {
            debug!(matches = best.len(), "localization failed: too few matches");
            return None;
        }

        let mut pairs: Vec<(usize, usize)> = best.into_iter().map(|(li, (fi, _))| (li, fi)).collect();
        pairs.sort_unstable();
        let source: Vec<_> = pairs.iter().map(|&(_, fi)| frame.features[fi].point).collect();
        let target: Vec<_> = pairs.iter().map(|&(li, _)| self.usable[li].position).collect();

        let fit_config = RobustFitConfig {
            inlier_threshold: self.config.inlier_threshold_m,
            min_inliers: self.config.min_inliers,
            max_iterations: self.config.max_iterations,
        };
        let Some(fit) = robust_rigid_fit(&source, &target, &fit_config) else {
            debug!(matches = pairs.len(), "localization failed: no consistent pose");
            return None;
        };

        let matched = fit.inliers.iter().map(|&i| self.usable[pairs[i].0].id).collect();
        debug!(
            matches = pairs.len(),
            inliers = fit.inliers.len(),
            rms_m = fit.rms_error,
            "localized"
        );
        Some(Localization {
            transform: fit.transform,
            matched,
            matches: pairs.len(),
            inliers: fit.inliers.len(),
            rms_error_m: fit.rms_error,
        })
    }

    /// Run [`Tracker::localize`] on the blocking pool. Dropping the future
    /// discards the result.
    pub async fn localize_in_background(self: Arc<Self>, frame: Frame) -> Option<Localization> {
        tokio::task::spawn_blocking(move || self.localize(&frame))
            .await
            .ok()
            .flatten()
    }

    /// Tracker-local copies of the map's landmarks with `is_matched` set for
    /// those supporting `localization`. For display only.
    pub fn matched_landmarks(&self, localization: &Localization) -> Vec<Landmark> {
        let Some(map) = &self.map else {
            return Vec::new();
        };
        map.landmarks()
            .map(|l| Landmark {
                is_matched: localization.matched.contains(&l.id),
                ..l.clone()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_builder::{DescriptorMapBuilder, MapBuilder};
    use lar_hal::{SimScene, SimSceneConfig};
    use lar_kernel::MapMutation;
    use lar_store::{DirectoryStore, SessionStore};
    use nalgebra::{Translation3, UnitQuaternion};

    fn corridor_map(scene: &SimScene) -> MapSnapshot {
        let mut map = Map::new();
        let mut builder = DescriptorMapBuilder::default();
        for step in (0..=120).step_by(15) {
            let delta = builder.add_frame(&map.snapshot(), &scene.frame_at(step)).unwrap();
            map.apply(MapMutation::ApplyLandmarks(delta)).unwrap();
        }
        let pass = builder.process(&map.snapshot()).unwrap();
        map.apply(MapMutation::ApplyLandmarks(pass)).unwrap();
        map.snapshot()
    }

    fn session_offset() -> Transform {
        Transform::from_parts(
            Translation3::new(3.0, -0.2, 7.5),
            UnitQuaternion::from_euler_angles(0.0, 1.1, 0.0),
        )
    }

    #[test]
    fn unbound_tracker_never_localizes() {
        let scene = SimScene::new(SimSceneConfig::default());
        let tracker = Tracker::default();
        assert!(!tracker.is_bound());
        assert!(tracker.localize(&scene.frame_at(30)).is_none());
    }

    #[test]
    fn localizes_a_frame_from_a_new_session() {
        let scene = SimScene::new(SimSceneConfig::default());
        let tracker = Tracker::new(corridor_map(&scene), TrackerConfig::default());
        assert!(tracker.usable_landmark_count() > 20);

        let frame = scene.frame_in_session(45, &session_offset());
        let loc = tracker.localize(&frame).expect("should localize");
        assert!(loc.inliers >= 6);
        assert_eq!(loc.matched.len(), loc.inliers);

        let truth = scene.camera_pose_at(45);
        assert!((loc.transform.translation.vector - truth.translation.vector).norm() < 1e-6);
        assert!(loc.transform.rotation.angle_to(&truth.rotation) < 1e-6);

        let origin = origin_in_tracking_frame(&loc, &frame.camera_pose);
        let expected = session_offset();
        assert!((origin.translation.vector - expected.translation.vector).norm() < 1e-6);
        assert!(origin.rotation.angle_to(&expected.rotation) < 1e-6);
    }

    #[test]
    fn zero_overlap_frame_fails_and_leaves_map_alone() {
        let scene = SimScene::new(SimSceneConfig::default());
        let map = corridor_map(&scene);
        let revision = map.revision();
        let tracker = Tracker::new(map, TrackerConfig::default());

        assert!(tracker.localize(&scene.unrelated_frame(45)).is_none());
        assert_eq!(tracker.map().unwrap().revision(), revision);
        assert!(tracker.map().unwrap().landmarks().all(|l| !l.is_matched));
    }

    #[test]
    fn matched_landmarks_flags_only_inliers() {
        let scene = SimScene::new(SimSceneConfig::default());
        let tracker = Tracker::new(corridor_map(&scene), TrackerConfig::default());
        let loc = tracker.localize(&scene.frame_at(60)).unwrap();

        let flagged = tracker.matched_landmarks(&loc);
        assert_eq!(flagged.iter().filter(|l| l.is_matched).count(), loc.inliers);
        assert!(tracker.map().unwrap().landmarks().all(|l| !l.is_matched));
    }

    #[test]
    fn loads_a_saved_map() {
        let scene = SimScene::new(SimSceneConfig::default());
        let map = corridor_map(&scene);
        let root = tempfile::tempdir().unwrap();
        let store = DirectoryStore::create_session(root.path()).unwrap();
        store.save_map(&map.to_archive()).unwrap();

        let tracker = Tracker::load(store.dir(), TrackerConfig::default()).unwrap();
        assert_eq!(tracker.map().unwrap().revision(), map.revision());
        assert!(tracker.localize(&scene.frame_at(90)).is_some());
    }

    #[test]
    fn load_missing_map_is_a_persistence_error() {
        let err = Tracker::load(Path::new("/no/such/session"), TrackerConfig::default()).unwrap_err();
        assert!(matches!(err, LarError::Persistence { .. }));
    }

    #[tokio::test]
    async fn background_localization_matches_inline() {
        let scene = SimScene::new(SimSceneConfig::default());
        let tracker = Arc::new(Tracker::new(corridor_map(&scene), TrackerConfig::default()));
        let frame = scene.frame_at(75);
        let inline = tracker.localize(&frame);
        let background = Arc::clone(&tracker).localize_in_background(frame).await;
        assert_eq!(inline, background);
    }
}
