//! Bounded pose history.
//!
//! The live mapper records every accepted [`PoseSample`] here so that a GPS
//! fix can be paired with the local position the device had at the fix's
//! timestamp, even when the fix arrives between two pose samples.
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use lar_perception::trajectory::Trajectory;
//! use lar_types::PoseSample;
//! use nalgebra::Vector3;
//!
//! let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
//! let mut trajectory = Trajectory::new(16);
//! trajectory.push(PoseSample { position: Vector3::new(0.0, 0.0, 0.0), timestamp: t0 });
//! trajectory.push(PoseSample {
//!     position: Vector3::new(2.0, 0.0, 0.0),
//!     timestamp: t0 + chrono::Duration::seconds(2),
//! });
//!
//! let midway = trajectory.position_at(t0 + chrono::Duration::seconds(1)).unwrap();
//! assert!((midway.x - 1.0).abs() < 1e-9);
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use lar_types::PoseSample;
use nalgebra::Vector3;

/// Default number of retained samples (about a minute at 60 Hz).
pub const DEFAULT_TRAJECTORY_CAPACITY: usize = 4096;

/// Ring buffer of pose samples ordered by timestamp.
#[derive(Debug, Clone)]
pub struct Trajectory {
    samples: VecDeque<PoseSample>,
    capacity: usize,
}

impl Trajectory {
    /// Create an empty trajectory retaining at most `capacity` samples
    /// (minimum 2, so interpolation always has a segment to work with).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity.min(DEFAULT_TRAJECTORY_CAPACITY)),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest one when full.
    ///
    /// Samples whose timestamp is not strictly newer than the latest one are
    /// rejected and `false` is returned.
    pub fn push(&mut self, sample: PoseSample) -> bool {
        if let Some(last) = self.samples.back() {
            if sample.timestamp <= last.timestamp {
                return false;
            }
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        true
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&PoseSample> {
        self.samples.back()
    }

    /// Local position at `at`.
    ///
    /// Interpolates linearly between the two samples bracketing `at` and
    /// clamps to the first/last sample outside the retained window. Returns
    /// `None` only when no sample has been recorded.
    pub fn position_at(&self, at: DateTime<Utc>) -> Option<Vector3<f64>> {
        let first = self.samples.front()?;
        let idx = self.samples.partition_point(|s| s.timestamp <= at);
        if idx == 0 {
            return Some(first.position);
        }
        let before = &self.samples[idx - 1];
        let Some(after) = self.samples.get(idx) else {
            return Some(before.position);
        };

        let span = seconds_between(before.timestamp, after.timestamp);
        let alpha = (seconds_between(before.timestamp, at) / span).clamp(0.0, 1.0);
        Some(before.position.lerp(&after.position, alpha))
    }
}

impl Default for Trajectory {
    fn default() -> Self {
        Self::new(DEFAULT_TRAJECTORY_CAPACITY)
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 * 1e-6,
        None => delta.num_milliseconds() as f64 * 1e-3,
    }
}
