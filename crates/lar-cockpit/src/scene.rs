//! [`DebugScene`] – the JSON document pushed to the cockpit page.

use lar_kernel::MapSnapshot;
use lar_perception::prioritize;
use lar_types::{AnchorId, GeodeticPoint, LandmarkId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneLandmark {
    pub id: LandmarkId,
    pub position: [f64; 3],
    pub usable: bool,
    pub observations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneAnchor {
    pub id: AnchorId,
    pub name: String,
    pub is_origin: bool,
    /// Column-major 4×4 homogeneous transform.
    pub matrix: [f64; 16],
}

/// Everything the debug view draws for one map revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugScene {
    pub revision: u64,
    /// At most `max_landmarks`, highest priority first.
    pub landmarks: Vec<SceneLandmark>,
    pub total_landmarks: usize,
    pub usable_landmarks: usize,
    /// Local positions of the GPS log, in arrival order.
    pub gps_track: Vec<[f64; 3]>,
    pub anchors: Vec<SceneAnchor>,
    pub user_location: Option<GeodeticPoint>,
}

impl DebugScene {
    pub fn build(
        snapshot: &MapSnapshot,
        max_landmarks: usize,
        user_location: Option<GeodeticPoint>,
    ) -> Self {
        let landmarks = prioritize(snapshot.landmarks(), max_landmarks)
            .into_iter()
            .map(|l| SceneLandmark {
                id: l.id,
                position: l.position.into(),
                usable: l.is_usable,
                observations: l.observations,
            })
            .collect();

        let anchors = snapshot
            .anchors()
            .map(|a| {
                let mut matrix = [0.0; 16];
                matrix.copy_from_slice(a.matrix().as_slice());
                SceneAnchor {
                    id: a.id,
                    name: a.name.clone(),
                    is_origin: a.is_origin(),
                    matrix,
                }
            })
            .collect();

        Self {
            revision: snapshot.revision(),
            landmarks,
            total_landmarks: snapshot.landmark_count(),
            usable_landmarks: snapshot.usable_landmark_count(),
            gps_track: snapshot
                .gps_observations()
                .iter()
                .map(|o| o.relative.into())
                .collect(),
            anchors,
            user_location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lar_kernel::{Map, MapMutation};
    use lar_types::{Descriptor, LandmarkDelta, NewLandmark, Transform};
    use nalgebra::{Translation3, UnitQuaternion, Vector3};

    fn landmark(k: u64, observations: u32, usable: bool) -> NewLandmark {
        NewLandmark {
            position: Vector3::new(k as f64, 0.0, -2.0),
            orientation: None,
            descriptor: Descriptor::from_seed(k),
            observations,
            last_seen: Default::default(),
            is_usable: usable,
        }
    }

    fn populated() -> Map {
        let mut map = Map::new();
        map.apply(MapMutation::ApplyLandmarks(LandmarkDelta {
            created: (0..8).map(|k| landmark(k, (k % 4) as u32 + 1, k % 2 == 0)).collect(),
            updated: vec![],
        }))
        .unwrap();
        map.apply(MapMutation::AddAnchor {
            name: "desk".into(),
            transform: Transform::from_parts(
                Translation3::new(1.0, 2.0, 3.0),
                UnitQuaternion::identity(),
            ),
        })
        .unwrap();
        map
    }

    #[test]
    fn landmarks_are_capped_and_prioritized() {
        let map = populated();
        let scene = DebugScene::build(&map.snapshot(), 3, None);
        assert_eq!(scene.landmarks.len(), 3);
        assert_eq!(scene.total_landmarks, 8);
        assert_eq!(scene.usable_landmarks, 4);
        assert!(scene.landmarks.iter().all(|l| l.usable));
        assert_eq!(scene.revision, map.revision());
    }

    #[test]
    fn anchors_carry_their_matrix() {
        let scene = DebugScene::build(&populated().snapshot(), 10, None);
        assert_eq!(scene.anchors.len(), 2);
        assert_eq!(scene.anchors.iter().filter(|a| a.is_origin).count(), 1);
        let desk = scene.anchors.iter().find(|a| a.name == "desk").unwrap();
        // Translation sits in the last column.
        assert_eq!(&desk.matrix[12..16], &[1.0, 2.0, 3.0, 1.0]);
    }

    #[test]
    fn scene_serializes_to_json() {
        let point = GeodeticPoint::new(47.0, 8.0);
        let scene = DebugScene::build(&populated().snapshot(), 2, Some(point));
        let json = serde_json::to_string(&scene).unwrap();
        let back: DebugScene = serde_json::from_str(&json).unwrap();
        assert_eq!(back.user_location, Some(point));
        assert_eq!(back.landmarks.len(), 2);
    }
}
