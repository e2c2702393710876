//! Deterministic synthetic capture for tests and demos without a device.
//!
//! [`SimScene`] models a device carried down a straight corridor whose two
//! walls are covered in textured points. Every point has a fixed
//! [`Descriptor`]; each frame observes the points within view range with a
//! little descriptor noise, exactly as a depth-enabled feature extractor
//! would report them (3-D in the camera frame). GPS fixes are derived from
//! the true trajectory through a fixed heading and geodetic origin, so
//! tests can compare georeferencing output against ground truth.
//!
//! # Example
//!
//! ```rust
//! use lar_hal::{CaptureEvent, CaptureSource, SimScene, SimSceneConfig};
//!
//! let mut scene = SimScene::new(SimSceneConfig { max_steps: Some(31), ..Default::default() });
//! let mut frames = 0;
//! while let Some(event) = scene.next_event().unwrap() {
//!     if let CaptureEvent::Frame(frame) = event {
//!         assert!(!frame.features.is_empty());
//!         frames += 1;
//!     }
//! }
//! assert_eq!(frames, 3);
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Duration, TimeZone, Utc};
use lar_types::{
    Descriptor, Feature, Frame, GeodeticPoint, GpsFix, LarError, PoseSample, Transform,
};
use nalgebra::{Point3, Rotation2, Translation3, UnitQuaternion, Vector2, Vector3};

use crate::capture::{CaptureEvent, CaptureSource};

/// Seed offset used to produce descriptors that match nothing in the scene.
const UNRELATED_SEED_OFFSET: u64 = 10_000_000;

/// Eye height of the simulated device, metres.
const EYE_HEIGHT_M: f64 = 1.4;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Parameters of the synthetic corridor walk.
#[derive(Debug, Clone)]
pub struct SimSceneConfig {
    pub corridor_length_m: f64,
    pub corridor_half_width_m: f64,
    /// Spacing between textured points along each wall.
    pub landmark_spacing_m: f64,
    pub walk_speed_mps: f64,
    pub pose_rate_hz: f64,
    /// A frame is emitted every `frame_interval` pose samples.
    pub frame_interval: u64,
    /// A GPS fix is emitted every `gps_interval` pose samples.
    pub gps_interval: u64,
    pub view_range_m: f64,
    /// Upper bound on flipped descriptor bits per observation.
    pub descriptor_noise_bits: usize,
    /// Geodetic position of the local origin.
    pub geo_origin: GeodeticPoint,
    /// Counter-clockwise angle from local `(x, −z)` to `(east, north)`.
    pub heading_rad: f64,
    pub gps_accuracy_m: f64,
    pub start: DateTime<Utc>,
    /// Attach a tiny placeholder image to every frame.
    pub with_images: bool,
    /// Stop after this many pose steps; `None` walks forever.
    pub max_steps: Option<u64>,
}

impl Default for SimSceneConfig {
    fn default() -> Self {
        Self {
            corridor_length_m: 40.0,
            corridor_half_width_m: 2.0,
            landmark_spacing_m: 0.5,
            walk_speed_mps: 0.8,
            pose_rate_hz: 30.0,
            frame_interval: 15,
            gps_interval: 30,
            view_range_m: 6.0,
            descriptor_noise_bits: 6,
            geo_origin: GeodeticPoint::new(47.3769, 8.5417),
            heading_rad: 0.4,
            gps_accuracy_m: 4.0,
            start: Utc
                .timestamp_opt(1_700_000_000, 0)
                .single()
                .unwrap_or_else(Utc::now),
            with_images: true,
            max_steps: None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimScene
// ────────────────────────────────────────────────────────────────────────────

/// A textured point in the simulated world.
#[derive(Debug, Clone, Copy)]
pub struct WorldPoint {
    pub position: Vector3<f64>,
    pub seed: u64,
    pub descriptor: Descriptor,
}

/// Synthetic corridor walk implementing [`CaptureSource`].
pub struct SimScene {
    config: SimSceneConfig,
    world: Vec<WorldPoint>,
    step: u64,
    pending: VecDeque<CaptureEvent>,
}

impl SimScene {
    pub fn new(config: SimSceneConfig) -> Self {
        let slices = (config.corridor_length_m / config.landmark_spacing_m).floor() as u64 + 1;
        let mut world = Vec::with_capacity(slices as usize * 4);
        let mut seed = 1;
        for k in 0..slices {
            let z = -(k as f64) * config.landmark_spacing_m;
            for side in [-1.0, 1.0] {
                for height in [0.6, 1.8] {
                    world.push(WorldPoint {
                        position: Vector3::new(side * config.corridor_half_width_m, height, z),
                        seed,
                        descriptor: Descriptor::from_seed(seed),
                    });
                    seed += 1;
                }
            }
        }
        Self {
            config,
            world,
            step: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &SimSceneConfig {
        &self.config
    }

    pub fn world(&self) -> &[WorldPoint] {
        &self.world
    }

    /// Index of the next pose step [`CaptureSource::next_event`] will emit.
    pub fn current_step(&self) -> u64 {
        self.step
    }

    pub fn timestamp_at(&self, step: u64) -> DateTime<Utc> {
        let micros = (step as f64 / self.config.pose_rate_hz * 1e6).round() as i64;
        self.config.start + Duration::microseconds(micros)
    }

    /// True camera position at `step` in the local frame.
    pub fn position_at(&self, step: u64) -> Vector3<f64> {
        let travelled = step as f64 / self.config.pose_rate_hz * self.config.walk_speed_mps;
        Vector3::new(0.0, EYE_HEIGHT_M, -travelled)
    }

    pub fn pose_at(&self, step: u64) -> PoseSample {
        PoseSample {
            position: self.position_at(step),
            timestamp: self.timestamp_at(step),
        }
    }

    /// Camera → local transform at `step`. The camera looks down `−z`.
    pub fn camera_pose_at(&self, step: u64) -> Transform {
        Transform::from_parts(
            Translation3::from(self.position_at(step)),
            UnitQuaternion::identity(),
        )
    }

    /// The frame a device would capture at `step`.
    pub fn frame_at(&self, step: u64) -> Frame {
        self.render(step, &Transform::identity(), 0)
    }

    /// Same view as [`SimScene::frame_at`], but reported by a device whose
    /// tracking frame is `session` relative to the mapped one (a new AR
    /// session after relaunch).
    pub fn frame_in_session(&self, step: u64, session: &Transform) -> Frame {
        self.render(step, session, 0)
    }

    /// Same geometry as [`SimScene::frame_at`] with descriptors that match no
    /// point in the scene.
    pub fn unrelated_frame(&self, step: u64) -> Frame {
        self.render(step, &Transform::identity(), UNRELATED_SEED_OFFSET)
    }

    /// The GPS fix a receiver would report at `step`.
    pub fn fix_at(&self, step: u64) -> GpsFix {
        GpsFix {
            timestamp: self.timestamp_at(step),
            coordinate: self.true_global(&self.position_at(step)),
            horizontal_accuracy: self.config.gps_accuracy_m,
            altitude: Some(408.0),
        }
    }

    /// Ground-truth geodetic coordinate of a local position.
    pub fn true_global(&self, local: &Vector3<f64>) -> GeodeticPoint {
        let en = Rotation2::new(self.config.heading_rad) * Vector2::new(local.x, -local.z);
        self.config.geo_origin.offset_by(en.x, en.y)
    }

    fn render(&self, step: u64, session: &Transform, seed_offset: u64) -> Frame {
        let camera = self.camera_pose_at(step);
        let world_to_camera = camera.inverse();
        let eye = self.position_at(step);
        let noise_span = self.config.descriptor_noise_bits as u64 + 1;

        let features = self
            .world
            .iter()
            .filter(|p| {
                let ahead = eye.z - p.position.z;
                ahead > 0.0 && (p.position - eye).norm() <= self.config.view_range_m
            })
            .map(|p| {
                let noise = ((step + p.seed) % noise_span) as usize;
                Feature {
                    descriptor: Descriptor::from_seed(p.seed + seed_offset).perturbed(noise),
                    point: (world_to_camera * Point3::from(p.position)).coords,
                }
            })
            .collect();

        Frame {
            timestamp: self.timestamp_at(step),
            camera_pose: session * camera,
            features,
            image: self
                .config
                .with_images
                .then(|| vec![(step % 251) as u8; 64]),
        }
    }

    fn enqueue_step(&mut self, step: u64) {
        self.pending.push_back(CaptureEvent::Pose(self.pose_at(step)));
        if self.config.gps_interval > 0 && step % self.config.gps_interval == 0 {
            self.pending
                .push_back(CaptureEvent::Locations(vec![self.fix_at(step)]));
        }
        if self.config.frame_interval > 0 && step % self.config.frame_interval == 0 {
            self.pending.push_back(CaptureEvent::Frame(self.frame_at(step)));
        }
    }
}

impl CaptureSource for SimScene {
    fn id(&self) -> &str {
        "sim"
    }

    fn next_event(&mut self) -> Result<Option<CaptureEvent>, LarError> {
        if self.pending.is_empty() {
            if self.config.max_steps.is_some_and(|max| self.step >= max) {
                return Ok(None);
            }
            let step = self.step;
            self.step += 1;
            self.enqueue_step(step);
        }
        Ok(self.pending.pop_front())
    }
}
