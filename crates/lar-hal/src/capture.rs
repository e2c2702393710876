//! Generic `CaptureSource` trait and the events it produces.

use lar_types::{Frame, GpsFix, LarError, PoseSample};
use serde::{Deserialize, Serialize};

/// One item from a device: a pose sample, a captured frame, or a batch of
/// location fixes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CaptureEvent {
    Pose(PoseSample),
    Frame(Frame),
    Locations(Vec<GpsFix>),
}

impl CaptureEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureEvent::Pose(_) => "pose",
            CaptureEvent::Frame(_) => "frame",
            CaptureEvent::Locations(_) => "locations",
        }
    }
}

/// A device (or stand-in) that yields capture events in time order.
pub trait CaptureSource: Send {
    /// Stable identifier for this source, e.g. `"sim"` or a file path.
    fn id(&self) -> &str;

    /// The next event, or `Ok(None)` once the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`LarError::Capture`] if the source cannot produce the event
    /// (e.g. a corrupt recording).
    fn next_event(&mut self) -> Result<Option<CaptureEvent>, LarError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nalgebra::Vector3;

    struct FixedSource {
        events: Vec<CaptureEvent>,
    }

    impl CaptureSource for FixedSource {
        fn id(&self) -> &str {
            "fixed"
        }

        fn next_event(&mut self) -> Result<Option<CaptureEvent>, LarError> {
            Ok(if self.events.is_empty() {
                None
            } else {
                Some(self.events.remove(0))
            })
        }
    }

    #[test]
    fn source_drains_then_reports_exhaustion() {
        let mut source = FixedSource {
            events: vec![CaptureEvent::Pose(PoseSample {
                position: Vector3::zeros(),
                timestamp: Utc::now(),
            })],
        };
        assert_eq!(source.id(), "fixed");
        assert_eq!(source.next_event().unwrap().unwrap().kind(), "pose");
        assert!(source.next_event().unwrap().is_none());
    }

    #[test]
    fn events_are_tagged_by_kind() {
        let json = serde_json::to_string(&CaptureEvent::Locations(vec![])).unwrap();
        assert_eq!(json, r#"{"kind":"locations","data":[]}"#);
    }
}
