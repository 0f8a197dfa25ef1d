use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

use super::backend::MotionDetector;
use super::result::DetectionCandidate;
use crate::frame::{Frame, Roi};

/// Replays candidates keyed by frame index. Frames without an entry yield nothing.
///
/// Used to drive the event and stereo stages with exact detections.
#[derive(Clone, Debug, Default)]
pub struct ScriptedDetector {
    script: BTreeMap<u64, Vec<DetectionCandidate>>,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, frame_index: u64, candidate: DetectionCandidate) -> Self {
        self.script.entry(frame_index).or_default().push(candidate);
        self
    }

    /// Same candidate on every frame in `frames`.
    pub fn span(mut self, frames: std::ops::RangeInclusive<u64>, candidate: DetectionCandidate) -> Self {
        for idx in frames {
            self.script.entry(idx).or_default().push(candidate);
        }
        self
    }
}

impl MotionDetector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &Frame, roi: &Roi) -> Result<Vec<DetectionCandidate>> {
        if !roi.fits(frame.width, frame.height) {
            return Err(anyhow!("roi {:?} does not fit inside frame", roi));
        }
        Ok(self.script.get(&frame.index).cloned().unwrap_or_default())
    }
}

/// Candidate with a square bounding box around the centre, for scripts and tests.
pub fn candidate(cx: f64, cy: f64, area: f64) -> DetectionCandidate {
    let side = area.sqrt().ceil().max(1.0) as u32;
    DetectionCandidate {
        cx,
        cy,
        area,
        bbox: (
            (cx - side as f64 / 2.0).max(0.0) as u32,
            (cy - side as f64 / 2.0).max(0.0) as u32,
            side,
            side,
        ),
    }
}
