//! The session map.
//!
//! A [`Map`] has exactly one owner (the live mapper's writer task). Every
//! change goes through [`Map::apply`], which first runs the
//! [`MapVerifier`] and only then mutates, so a rejected mutation leaves the
//! map exactly as it was.
//!
//! Readers never see the map itself. [`Map::snapshot`] hands out a
//! [`MapSnapshot`] whose collections are `Arc`-shared; the writer uses
//! copy-on-write (`Arc::make_mut`), so taking a snapshot is O(1) and a
//! snapshot never changes after it was taken.
//!
//! The cost sits on the write side. The live mapper's `watch` channel
//! always holds the latest snapshot, so a collection is shared whenever it
//! is mutated and `Arc::make_mut` clones it: a commit costs O(size of the
//! touched collection). Landmarks, anchors and the GPS log are separate
//! `Arc`s, so a GPS append copies only the GPS log and an anchor change
//! copies only the anchors.
//!
//! # Invariants
//!
//! | Invariant | Enforced by |
//! |---|---|
//! | landmark / anchor ids are unique, monotonic, never reused | id counters owned by the map |
//! | GPS observations strictly time-ordered | [`GpsChronologyRule`](crate::GpsChronologyRule) |
//! | exactly one `MapOrigin` anchor per revision | [`SingleOriginRule`](crate::SingleOriginRule) + [`MapMutation::ReplaceOrigin`] |
//! | `revision` increases by one per committed mutation | [`Map::apply`] |

use std::collections::BTreeMap;
use std::collections::btree_map::Values;
use std::sync::Arc;

use chrono::Utc;
use lar_types::{
    Anchor, AnchorId, AnchorKind, GpsObservation, Landmark, LandmarkDelta, LandmarkId, LarError,
    MapArchive, MapChange, MapChangeKind, Transform,
};
use tracing::debug;

use crate::map_verifier::MapVerifier;

/// Name given to the system-created map-origin anchor.
pub const ORIGIN_ANCHOR_NAME: &str = "map-origin";

// ────────────────────────────────────────────────────────────────────────────
// Mutations
// ────────────────────────────────────────────────────────────────────────────

/// A single atomic change to the map.
#[derive(Debug, Clone, PartialEq)]
pub enum MapMutation {
    /// Commit a map-builder proposal.
    ApplyLandmarks(LandmarkDelta),
    /// Append GPS observations (in arrival order).
    AppendGps(Vec<GpsObservation>),
    /// Place a user anchor.
    AddAnchor { name: String, transform: Transform },
    /// Remove the current map-origin anchor and add a new one, in one
    /// revision.
    ReplaceOrigin { transform: Transform },
}

impl MapMutation {
    pub fn label(&self) -> &'static str {
        match self {
            MapMutation::ApplyLandmarks(_) => "apply_landmarks",
            MapMutation::AppendGps(_) => "append_gps",
            MapMutation::AddAnchor { .. } => "add_anchor",
            MapMutation::ReplaceOrigin { .. } => "replace_origin",
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MapSnapshot
// ────────────────────────────────────────────────────────────────────────────

/// Immutable point-in-time view of a [`Map`]. Cloning is O(1).
#[derive(Debug, Clone)]
pub struct MapSnapshot {
    revision: u64,
    landmarks: Arc<BTreeMap<LandmarkId, Landmark>>,
    anchors: Arc<BTreeMap<AnchorId, Anchor>>,
    gps: Arc<Vec<GpsObservation>>,
    next_landmark_id: u64,
    next_anchor_id: u64,
}

impl MapSnapshot {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Landmarks in identity order.
    pub fn landmarks(&self) -> Values<'_, LandmarkId, Landmark> {
        self.landmarks.values()
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn landmark_count(&self) -> usize {
        self.landmarks.len()
    }

    pub fn usable_landmark_count(&self) -> usize {
        self.landmarks.values().filter(|l| l.is_usable).count()
    }

    /// Anchors in identity order.
    pub fn anchors(&self) -> Values<'_, AnchorId, Anchor> {
        self.anchors.values()
    }

    pub fn anchor(&self, id: AnchorId) -> Option<&Anchor> {
        self.anchors.get(&id)
    }

    /// The map-origin anchor.
    pub fn origin(&self) -> Option<&Anchor> {
        self.anchors.values().find(|a| a.is_origin())
    }

    pub fn gps_observations(&self) -> &[GpsObservation] {
        &self.gps
    }

    /// Next landmark identity the map would assign.
    pub fn next_landmark_id(&self) -> LandmarkId {
        LandmarkId(self.next_landmark_id)
    }

    /// Plain serializable copy for persistence.
    pub fn to_archive(&self) -> MapArchive {
        MapArchive {
            landmarks: self.landmarks.values().cloned().collect(),
            anchors: self.anchors.values().cloned().collect(),
            gps_observations: self.gps.as_ref().clone(),
            next_landmark_id: self.next_landmark_id,
            next_anchor_id: self.next_anchor_id,
            revision: self.revision,
        }
    }
}

/// Anything that can produce the latest committed snapshot without
/// blocking behind a writer.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> MapSnapshot;
}

impl SnapshotSource for MapSnapshot {
    fn snapshot(&self) -> MapSnapshot {
        self.clone()
    }
}

impl<T: SnapshotSource + ?Sized> SnapshotSource for Arc<T> {
    fn snapshot(&self) -> MapSnapshot {
        (**self).snapshot()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Map
// ────────────────────────────────────────────────────────────────────────────

/// The mutable session map. Deliberately not `Clone`: there is one writer.
pub struct Map {
    state: MapSnapshot,
    verifier: MapVerifier,
}

impl Map {
    /// A new, empty map containing only the map-origin anchor at identity.
    pub fn new() -> Self {
        let origin = Anchor {
            id: AnchorId(0),
            name: ORIGIN_ANCHOR_NAME.to_string(),
            kind: AnchorKind::MapOrigin,
            transform: Transform::identity(),
            created_at: Utc::now(),
        };
        let mut anchors = BTreeMap::new();
        anchors.insert(origin.id, origin);
        Self {
            state: MapSnapshot {
                revision: 0,
                landmarks: Arc::new(BTreeMap::new()),
                anchors: Arc::new(anchors),
                gps: Arc::new(Vec::new()),
                next_landmark_id: 0,
                next_anchor_id: 1,
            },
            verifier: MapVerifier::standard(),
        }
    }

    /// Rebuild a map from its archived form, checking every invariant.
    pub fn from_archive(archive: MapArchive) -> Result<Self, LarError> {
        let corrupt = |details: String| LarError::Invariant {
            rule: "archive".to_string(),
            details,
        };

        let mut landmarks = BTreeMap::new();
        for mut landmark in archive.landmarks {
            if landmark.id.0 >= archive.next_landmark_id {
                return Err(corrupt(format!(
                    "landmark {} not below id counter {}",
                    landmark.id, archive.next_landmark_id
                )));
            }
            landmark.is_matched = false;
            if let Some(dup) = landmarks.insert(landmark.id, landmark) {
                return Err(corrupt(format!("duplicate landmark {}", dup.id)));
            }
        }

        let mut anchors = BTreeMap::new();
        for anchor in archive.anchors {
            if anchor.id.0 >= archive.next_anchor_id {
                return Err(corrupt(format!(
                    "anchor {} not below id counter {}",
                    anchor.id, archive.next_anchor_id
                )));
            }
            if let Some(dup) = anchors.insert(anchor.id, anchor) {
                return Err(corrupt(format!("duplicate anchor {}", dup.id)));
            }
        }
        let origins = anchors.values().filter(|a| a.is_origin()).count();
        if origins != 1 {
            return Err(corrupt(format!("expected one map origin, found {origins}")));
        }

        if archive
            .gps_observations
            .windows(2)
            .any(|w| w[1].timestamp <= w[0].timestamp)
        {
            return Err(corrupt("GPS observations out of order".to_string()));
        }

        Ok(Self {
            state: MapSnapshot {
                revision: archive.revision,
                landmarks: Arc::new(landmarks),
                anchors: Arc::new(anchors),
                gps: Arc::new(archive.gps_observations),
                next_landmark_id: archive.next_landmark_id,
                next_anchor_id: archive.next_anchor_id,
            },
            verifier: MapVerifier::standard(),
        })
    }

    /// Replace the rule set (mainly for tests or stricter deployments).
    pub fn with_verifier(mut self, verifier: MapVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// O(1) snapshot of the current revision.
    pub fn snapshot(&self) -> MapSnapshot {
        self.state.clone()
    }

    pub fn revision(&self) -> u64 {
        self.state.revision
    }

    /// Verify and apply `mutation` as one new revision.
    ///
    /// On `Err` the map is untouched.
    pub fn apply(&mut self, mutation: MapMutation) -> Result<MapChange, LarError> {
        self.verifier.verify(&self.state, &mutation)?;

        let kind = match mutation {
            MapMutation::ApplyLandmarks(delta) => {
                let created = delta.created.len();
                let updated = delta.updated.len();
                let landmarks = Arc::make_mut(&mut self.state.landmarks);
                for mut landmark in delta.updated {
                    landmark.is_matched = false;
                    landmarks.insert(landmark.id, landmark);
                }
                for proposal in delta.created {
                    let id = LandmarkId(self.state.next_landmark_id);
                    self.state.next_landmark_id += 1;
                    landmarks.insert(
                        id,
                        Landmark {
                            id,
                            position: proposal.position,
                            orientation: proposal.orientation,
                            descriptor: proposal.descriptor,
                            observations: proposal.observations,
                            last_seen: proposal.last_seen,
                            is_usable: proposal.is_usable,
                            is_matched: false,
                        },
                    );
                }
                MapChangeKind::LandmarksUpdated { created, updated }
            }
            MapMutation::AppendGps(observations) => {
                let count = observations.len();
                Arc::make_mut(&mut self.state.gps).extend(observations);
                MapChangeKind::GpsObservationsAppended { count }
            }
            MapMutation::AddAnchor { name, transform } => {
                let id = self.allocate_anchor_id();
                Arc::make_mut(&mut self.state.anchors).insert(
                    id,
                    Anchor {
                        id,
                        name,
                        kind: AnchorKind::User,
                        transform,
                        created_at: Utc::now(),
                    },
                );
                MapChangeKind::AnchorAdded { id }
            }
            MapMutation::ReplaceOrigin { transform } => {
                let removed = self
                    .state
                    .origin()
                    .map(|a| a.id)
                    .ok_or_else(|| LarError::Invariant {
                        rule: "single_origin".to_string(),
                        details: "map has no origin anchor".to_string(),
                    })?;
                let added = self.allocate_anchor_id();
                let anchors = Arc::make_mut(&mut self.state.anchors);
                anchors.remove(&removed);
                anchors.insert(
                    added,
                    Anchor {
                        id: added,
                        name: ORIGIN_ANCHOR_NAME.to_string(),
                        kind: AnchorKind::MapOrigin,
                        transform,
                        created_at: Utc::now(),
                    },
                );
                MapChangeKind::OriginReplaced { removed, added }
            }
        };

        self.state.revision += 1;
        debug!(revision = self.state.revision, change = ?kind, "map revision committed");
        Ok(MapChange {
            revision: self.state.revision,
            kind,
        })
    }

    fn allocate_anchor_id(&mut self) -> AnchorId {
        let id = AnchorId(self.state.next_anchor_id);
        self.state.next_anchor_id += 1;
        id
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone};
    use lar_types::{Descriptor, GeodeticPoint, NewLandmark};
    use nalgebra::{Translation3, UnitQuaternion, Vector3};

    fn ts(s: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(s)
    }

    fn proposal(seed: u64) -> NewLandmark {
        NewLandmark {
            position: Vector3::new(seed as f64, 0.0, 1.0),
            orientation: None,
            descriptor: Descriptor::from_seed(seed),
            observations: 1,
            last_seen: ts(0),
            is_usable: false,
        }
    }

    fn gps(s: i64) -> GpsObservation {
        GpsObservation {
            timestamp: ts(s),
            relative: Vector3::new(s as f64, 0.0, 0.0),
            global: GeodeticPoint::new(48.0, 11.0),
            accuracy: 5.0,
        }
    }

    fn shifted(x: f64) -> Transform {
        Transform::from_parts(Translation3::new(x, 0.0, 0.0), UnitQuaternion::identity())
    }

    #[test]
    fn new_map_has_single_origin_at_identity() {
        let map = Map::new();
        let snap = map.snapshot();
        assert_eq!(snap.revision(), 0);
        assert_eq!(snap.anchors().count(), 1);
        let origin = snap.origin().unwrap();
        assert_eq!(origin.transform, Transform::identity());
        assert_eq!(origin.name, ORIGIN_ANCHOR_NAME);
    }

    #[test]
    fn created_landmarks_get_fresh_monotonic_ids() {
        let mut map = Map::new();
        map.apply(MapMutation::ApplyLandmarks(LandmarkDelta {
            created: vec![proposal(1), proposal(2)],
            updated: vec![],
        }))
        .unwrap();
        map.apply(MapMutation::ApplyLandmarks(LandmarkDelta {
            created: vec![proposal(3)],
            updated: vec![],
        }))
        .unwrap();

        let snap = map.snapshot();
        let ids: Vec<u64> = snap.landmarks().map(|l| l.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(snap.revision(), 2);
    }

    #[test]
    fn snapshots_are_unaffected_by_later_commits() {
        let mut map = Map::new();
        map.apply(MapMutation::AppendGps(vec![gps(1)])).unwrap();
        let before = map.snapshot();

        map.apply(MapMutation::AppendGps(vec![gps(2), gps(3)])).unwrap();
        assert_eq!(before.gps_observations().len(), 1);
        assert_eq!(map.snapshot().gps_observations().len(), 3);
    }

    #[test]
    fn rejected_mutation_leaves_map_untouched() {
        let mut map = Map::new();
        map.apply(MapMutation::AppendGps(vec![gps(5)])).unwrap();

        // Second observation in the batch goes back in time.
        let err = map
            .apply(MapMutation::AppendGps(vec![gps(6), gps(4)]))
            .unwrap_err();
        assert!(matches!(err, LarError::Invariant { .. }));
        assert_eq!(map.snapshot().gps_observations().len(), 1);
        assert_eq!(map.revision(), 1);
    }

    #[test]
    fn updating_unknown_landmark_is_rejected() {
        let mut map = Map::new();
        let ghost = Landmark {
            id: LandmarkId(42),
            position: Vector3::zeros(),
            orientation: None,
            descriptor: Descriptor::from_seed(42),
            observations: 3,
            last_seen: ts(0),
            is_usable: true,
            is_matched: false,
        };
        let result = map.apply(MapMutation::ApplyLandmarks(LandmarkDelta {
            created: vec![proposal(1)],
            updated: vec![ghost],
        }));
        assert!(result.is_err());
        assert_eq!(map.snapshot().landmark_count(), 0);
    }

    #[test]
    fn replace_origin_swaps_exactly_one_anchor() {
        let mut map = Map::new();
        map.apply(MapMutation::AddAnchor {
            name: "desk".to_string(),
            transform: shifted(2.0),
        })
        .unwrap();
        let before = map.snapshot();
        let old_origin = before.origin().unwrap().id;

        let change = map
            .apply(MapMutation::ReplaceOrigin {
                transform: shifted(-1.0),
            })
            .unwrap();

        let after = map.snapshot();
        match change.kind {
            MapChangeKind::OriginReplaced { removed, added } => {
                assert_eq!(removed, old_origin);
                assert!(after.anchor(removed).is_none());
                assert!(after.anchor(added).unwrap().is_origin());
                assert!(added > removed);
            }
            other => panic!("unexpected change {other:?}"),
        }
        assert_eq!(after.anchors().filter(|a| a.is_origin()).count(), 1);
        assert_eq!(after.anchors().count(), before.anchors().count());
        assert_eq!(before.anchors().filter(|a| a.is_origin()).count(), 1);
    }

    #[test]
    fn archive_roundtrip_preserves_counters() {
        let mut map = Map::new();
        map.apply(MapMutation::ApplyLandmarks(LandmarkDelta {
            created: vec![proposal(1), proposal(2)],
            updated: vec![],
        }))
        .unwrap();
        map.apply(MapMutation::AppendGps(vec![gps(1), gps(2)])).unwrap();

        let archive = map.snapshot().to_archive();
        let mut restored = Map::from_archive(archive.clone()).unwrap();
        assert_eq!(restored.snapshot().to_archive(), archive);

        restored
            .apply(MapMutation::ApplyLandmarks(LandmarkDelta {
                created: vec![proposal(9)],
                updated: vec![],
            }))
            .unwrap();
        assert!(restored.snapshot().landmark(LandmarkId(2)).is_some());
    }

    #[test]
    fn archive_without_origin_is_rejected() {
        let mut archive = Map::new().snapshot().to_archive();
        archive.anchors.clear();
        assert!(Map::from_archive(archive).is_err());
    }
}
