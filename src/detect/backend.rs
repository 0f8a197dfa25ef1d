use anyhow::Result;

use crate::detect::result::DetectionCandidate;
use crate::frame::{Frame, Roi};

/// Per-stream motion detector.
///
/// Implementations own whatever temporal state they need (background model,
/// replay cursor) and must be fed frames in stream order. Candidates are in
/// full-frame coordinates and already filtered by area.
pub trait MotionDetector: Send {
    /// Detector identifier for logs.
    fn name(&self) -> &'static str;

    /// Segment one frame inside `roi`.
    fn detect(&mut self, frame: &Frame, roi: &Roi) -> Result<Vec<DetectionCandidate>>;
}
