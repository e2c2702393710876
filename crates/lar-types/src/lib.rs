//! Shared data model for the live mapping session.
//!
//! Every crate in the workspace speaks these types: landmarks, anchors, GPS
//! observations, captured frames, the bus [`Event`] envelope, and the global
//! [`LarError`].
//!
//! Coordinates follow the device tracking convention: metres, right-handed,
//! gravity-aligned with `+y` up, so the horizontal plane is `x`/`z`.

use std::fmt;

use chrono::{DateTime, Utc};
use nalgebra::{Isometry3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Rigid transform in the local map frame.
pub type Transform = Isometry3<f64>;

/// Mean Earth radius (IUGG) in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Width of a binary feature descriptor in bytes (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;

// ────────────────────────────────────────────────────────────────────────────
// Identities
// ────────────────────────────────────────────────────────────────────────────

/// Stable landmark identity. Assigned by the map, monotonic, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LandmarkId(pub u64);

/// Stable anchor identity. Assigned by the map, monotonic, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchorId(pub u64);

/// Sequence number of a frame ingested during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u64);

impl fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A{}", self.0)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Descriptors
// ────────────────────────────────────────────────────────────────────────────

/// 256-bit binary feature descriptor compared by Hamming distance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    /// Deterministically expand `seed` into a descriptor (splitmix64).
    ///
    /// Distinct seeds give descriptors roughly 128 bits apart, which is what
    /// simulated scenes and tests rely on.
    pub fn from_seed(seed: u64) -> Self {
        let mut state = seed;
        let mut bytes = [0u8; DESCRIPTOR_BYTES];
        for chunk in bytes.chunks_mut(8) {
            state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^= z >> 31;
            chunk.copy_from_slice(&z.to_le_bytes());
        }
        Self(bytes)
    }

    /// Hamming distance in bits.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    /// Copy of this descriptor with `bits` evenly spread bits flipped.
    ///
    /// Models appearance noise between two observations of the same point.
    pub fn perturbed(&self, bits: usize) -> Self {
        let mut bytes = self.0;
        let total = DESCRIPTOR_BYTES * 8;
        for i in 0..bits.min(total) {
            let bit = (i * 37) % total;
            bytes[bit / 8] ^= 1 << (bit % 8);
        }
        Self(bytes)
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…)")
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Map contents
// ────────────────────────────────────────────────────────────────────────────

/// A persistent 3-D feature point in the local map frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub id: LandmarkId,
    pub position: Vector3<f64>,
    pub orientation: Option<Vector3<f64>>,
    pub descriptor: Descriptor,
    /// Number of frames that observed this landmark.
    pub observations: u32,
    pub last_seen: DateTime<Utc>,
    /// Enough supporting observations to be trusted for localization.
    pub is_usable: bool,
    /// Matched during the current localization attempt. Only ever set on
    /// tracker-local copies, never on map state.
    pub is_matched: bool,
}

/// A landmark proposed by a map builder that has no identity yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLandmark {
    pub position: Vector3<f64>,
    pub orientation: Option<Vector3<f64>>,
    pub descriptor: Descriptor,
    pub observations: u32,
    pub last_seen: DateTime<Utc>,
    pub is_usable: bool,
}

/// Landmark changes proposed by a map builder, committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LandmarkDelta {
    pub created: Vec<NewLandmark>,
    /// Replacements for existing landmarks, keyed by their `id`.
    pub updated: Vec<Landmark>,
}

impl LandmarkDelta {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty()
    }
}

/// Whether an anchor is the distinguished map origin or a user placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnchorKind {
    MapOrigin,
    User,
}

/// A named rigid transform in the map frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub id: AnchorId,
    pub name: String,
    pub kind: AnchorKind,
    pub transform: Transform,
    pub created_at: DateTime<Utc>,
}

impl Anchor {
    /// The anchor transform as a 4×4 homogeneous matrix.
    pub fn matrix(&self) -> Matrix4<f64> {
        self.transform.to_homogeneous()
    }

    pub fn is_origin(&self) -> bool {
        self.kind == AnchorKind::MapOrigin
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Geodetic data
// ────────────────────────────────────────────────────────────────────────────

/// WGS-84 latitude/longitude in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeodeticPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeodeticPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle (haversine) distance in metres.
    pub fn distance_m(&self, other: &GeodeticPoint) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
    }

    /// East/north offset in metres from `self` to `other` on the local
    /// tangent plane (equirectangular; accurate over a few kilometres).
    pub fn enu_offset_to(&self, other: &GeodeticPoint) -> (f64, f64) {
        let east = wrap_longitude(other.longitude - self.longitude).to_radians()
            * EARTH_RADIUS_M
            * self.latitude.to_radians().cos();
        let north = (other.latitude - self.latitude).to_radians() * EARTH_RADIUS_M;
        (east, north)
    }

    /// Inverse of [`GeodeticPoint::enu_offset_to`].
    pub fn offset_by(&self, east_m: f64, north_m: f64) -> GeodeticPoint {
        GeodeticPoint {
            latitude: self.latitude + (north_m / EARTH_RADIUS_M).to_degrees(),
            longitude: wrap_longitude(
                self.longitude
                    + (east_m / (EARTH_RADIUS_M * self.latitude.to_radians().cos())).to_degrees(),
            ),
        }
    }
}

/// Fold a longitude (or longitude difference) into `[-180, 180)` degrees.
pub fn wrap_longitude(degrees: f64) -> f64 {
    (degrees + 540.0).rem_euclid(360.0) - 180.0
}

/// A raw fix delivered by a location source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub timestamp: DateTime<Utc>,
    pub coordinate: GeodeticPoint,
    /// Horizontal accuracy radius in metres.
    pub horizontal_accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

/// A GPS fix paired with the local position the device had when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsObservation {
    pub timestamp: DateTime<Utc>,
    pub relative: Vector3<f64>,
    pub global: GeodeticPoint,
    pub accuracy: f64,
}

// ────────────────────────────────────────────────────────────────────────────
// Capture data
// ────────────────────────────────────────────────────────────────────────────

/// Lightweight camera position sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    pub position: Vector3<f64>,
    pub timestamp: DateTime<Utc>,
}

/// A depth-backed keypoint: descriptor plus 3-D point in the camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub descriptor: Descriptor,
    pub point: Vector3<f64>,
}

/// A captured camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp: DateTime<Utc>,
    /// Camera pose in the device tracking frame (camera → tracking).
    pub camera_pose: Transform,
    pub features: Vec<Feature>,
    /// Encoded image bytes; the codec is opaque to the mapper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<u8>>,
}

/// Per-frame entry of the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub id: FrameId,
    pub timestamp: DateTime<Utc>,
    pub position: Vector3<f64>,
    pub feature_count: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// Persistence forms
// ────────────────────────────────────────────────────────────────────────────

/// Plain, serializable form of a whole map.
///
/// Carries the identity counters so that ids are never reused after reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapArchive {
    pub landmarks: Vec<Landmark>,
    pub anchors: Vec<Anchor>,
    pub gps_observations: Vec<GpsObservation>,
    pub next_landmark_id: u64,
    pub next_anchor_id: u64,
    pub revision: u64,
}

/// Contents of a session's `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub map_revision: u64,
    pub frame_count: usize,
    pub frames: Vec<FrameRecord>,
    pub gps_observations: Vec<GpsObservation>,
    pub landmark_count: usize,
    pub usable_landmark_count: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// Bus events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the session event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "lar-runtime::live_mapper"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// A mutation was committed to the map.
    MapChanged(MapChange),
    /// The tracker placed a frame inside a saved map.
    Localized {
        matched: usize,
        inliers: usize,
        transform: Transform,
    },
    LocalizationFailed { reason: String },
    /// Georeferenced device position that passed the display hysteresis.
    UserLocation(GeodeticPoint),
    FrameSkipped { reason: String },
    PersistenceFault { operation: String, message: String },
}

/// Notification emitted after each committed map revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapChange {
    pub revision: u64,
    pub kind: MapChangeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapChangeKind {
    LandmarksUpdated { created: usize, updated: usize },
    GpsObservationsAppended { count: usize },
    AnchorAdded { id: AnchorId },
    OriginReplaced { removed: AnchorId, added: AnchorId },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type spanning map invariants, persistence, and the builder.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LarError {
    #[error("Map invariant violated ({rule}): {details}")]
    Invariant { rule: String, details: String },

    #[error("Persistence failure during {operation}: {details}")]
    Persistence { operation: String, details: String },

    #[error("Map builder error: {0}")]
    Builder(String),

    #[error("Capture source {device} failed: {details}")]
    Capture { device: String, details: String },

    #[error("Live mapper has shut down")]
    MapperClosed,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
