//! Motion segmenter: background subtraction to area-filtered blobs.
//!
//! Per frame:
//! 1. Crop to the ROI and convert to luminance
//! 2. Classify against the per-pixel mixture model (which also learns the frame)
//! 3. Open the foreground mask with an elliptical element (optionally close it)
//! 4. Extract outer contours, keep those whose area lies strictly inside the range
//! 5. Report centroids offset back into full-frame coordinates
//!
//! `MotionSegmenter` is immutable configuration. The mutable background state
//! lives in `SegmenterState`, one per stream.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::backend::MotionDetector;
use super::background::{BackgroundModel, BackgroundParams};
use super::contour::external_contours;
use super::morphology::{self, StructuringElement, MAX_ELEMENT_SIZE};
use super::result::{AreaRange, DetectionCandidate};
use crate::frame::{Frame, Roi};

/// Default structuring element size.
pub const NOISE_KERNEL: u32 = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmenterParams {
    pub background: BackgroundParams,
    pub kernel_size: u32,
    /// Apply a closing pass after the opening.
    pub close_gaps: bool,
    pub area: AreaRange,
}

impl Default for SegmenterParams {
    fn default() -> Self {
        Self {
            background: BackgroundParams::default(),
            kernel_size: NOISE_KERNEL,
            close_gaps: false,
            area: AreaRange::default(),
        }
    }
}

impl SegmenterParams {
    pub fn validate(&self) -> Result<()> {
        self.background.validate()?;
        if self.kernel_size == 0 || self.kernel_size > MAX_ELEMENT_SIZE {
            return Err(anyhow!(
                "kernel size must be in 1..={} (got {})",
                MAX_ELEMENT_SIZE,
                self.kernel_size
            ));
        }
        if !(self.area.min >= 0.0 && self.area.min < self.area.max) {
            return Err(anyhow!(
                "area range must satisfy 0 <= min < max (got {} .. {})",
                self.area.min,
                self.area.max
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct MotionSegmenter {
    params: SegmenterParams,
    element: StructuringElement,
}

/// Mutable per-stream segmentation state.
#[derive(Clone, Debug)]
pub struct SegmenterState {
    background: BackgroundModel,
}

impl SegmenterState {
    pub fn frames_seen(&self) -> u64 {
        self.background.frames_seen()
    }
}

impl MotionSegmenter {
    pub fn new(params: SegmenterParams) -> Result<Self> {
        params.validate()?;
        let element = StructuringElement::ellipse(params.kernel_size)?;
        Ok(Self { params, element })
    }

    pub fn params(&self) -> &SegmenterParams {
        &self.params
    }

    /// Fresh background state for a new stream.
    pub fn new_state(&self) -> SegmenterState {
        SegmenterState {
            background: BackgroundModel::new(self.params.background.clone()),
        }
    }

    /// Detector that owns its own state, for use behind `MotionDetector`.
    pub fn session(&self) -> SegmenterSession {
        SegmenterSession {
            segmenter: self.clone(),
            state: self.new_state(),
        }
    }

    pub fn segment(
        &self,
        state: &mut SegmenterState,
        frame: &Frame,
        roi: &Roi,
    ) -> Result<Vec<DetectionCandidate>> {
        let gray = frame.to_gray(roi)?;
        let mask = state.background.apply(&gray)?;
        let mut mask = morphology::open(&mask, &self.element);
        if self.params.close_gaps {
            mask = morphology::close(&mask, &self.element);
        }

        let mut candidates = Vec::new();
        for contour in external_contours(&mask) {
            let moments = contour.moments();
            let area = moments.area();
            if !self.params.area.contains(area) {
                continue;
            }
            let Some((cx, cy)) = moments.centroid() else {
                continue;
            };
            let (bx, by, bw, bh) = contour.bbox;
            candidates.push(DetectionCandidate {
                cx: cx + roi.x as f64,
                cy: cy + roi.y as f64,
                area,
                bbox: (bx + roi.x, by + roi.y, bw, bh),
            });
        }
        Ok(candidates)
    }
}

pub struct SegmenterSession {
    segmenter: MotionSegmenter,
    state: SegmenterState,
}

impl SegmenterSession {
    pub fn state(&self) -> &SegmenterState {
        &self.state
    }
}

impl MotionDetector for SegmenterSession {
    fn name(&self) -> &'static str {
        "mixture"
    }

    fn detect(&mut self, frame: &Frame, roi: &Roi) -> Result<Vec<DetectionCandidate>> {
        self.segmenter.segment(&mut self.state, frame, roi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dark(index: u64) -> Frame {
        Frame::filled(40, 30, [12, 12, 12], index, index as f64 / 30.0)
    }

    fn with_disk(index: u64, cx: i32, cy: i32, r: i32) -> Frame {
        let mut f = dark(index);
        for y in cy - r..=cy + r {
            for x in cx - r..=cx + r {
                if (x - cx).pow(2) + (y - cy).pow(2) <= r * r && x >= 0 && y >= 0 {
                    f.set_pixel(x as u32, y as u32, [230, 230, 230]);
                }
            }
        }
        f
    }

    #[test]
    fn moving_blob_is_detected_with_full_frame_centroid() {
        let seg = MotionSegmenter::new(SegmenterParams::default()).unwrap();
        let mut state = seg.new_state();
        let roi = Roi::new(5, 5, 30, 20).unwrap();
        for i in 1..=30 {
            let found = seg.segment(&mut state, &dark(i), &roi).unwrap();
            if i > 1 {
                assert!(found.is_empty(), "frame {i} should be quiet");
            }
        }
        let found = seg.segment(&mut state, &with_disk(31, 20, 14, 3), &roi).unwrap();
        assert_eq!(found.len(), 1);
        let c = found[0];
        assert!((c.cx - 20.0).abs() < 0.5, "cx {}", c.cx);
        assert!((c.cy - 14.0).abs() < 0.5, "cy {}", c.cy);
        assert!(c.area > 5.0 && c.area < 100.0);
        assert_eq!(state.frames_seen(), 31);
    }

    #[test]
    fn oversized_blob_is_discarded() {
        let seg = MotionSegmenter::new(SegmenterParams::default()).unwrap();
        let mut state = seg.new_state();
        let roi = Roi::full(40, 30);
        for i in 1..=30 {
            seg.segment(&mut state, &dark(i), &roi).unwrap();
        }
        let found = seg.segment(&mut state, &with_disk(31, 20, 15, 8), &roi).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn speck_is_removed_by_opening() {
        let seg = MotionSegmenter::new(SegmenterParams::default()).unwrap();
        let mut state = seg.new_state();
        let roi = Roi::full(40, 30);
        for i in 1..=30 {
            seg.segment(&mut state, &dark(i), &roi).unwrap();
        }
        let mut frame = dark(31);
        frame.set_pixel(10, 10, [255, 255, 255]);
        frame.set_pixel(11, 10, [255, 255, 255]);
        assert!(seg.segment(&mut state, &frame, &roi).unwrap().is_empty());
    }

    #[test]
    fn roi_outside_frame_is_an_error() {
        let seg = MotionSegmenter::new(SegmenterParams::default()).unwrap();
        let mut state = seg.new_state();
        let roi = Roi::new(30, 20, 20, 20).unwrap();
        assert!(seg.segment(&mut state, &dark(1), &roi).is_err());
    }

    #[test]
    fn invalid_area_range_is_rejected() {
        let params = SegmenterParams {
            area: AreaRange::new(50.0, 10.0),
            ..SegmenterParams::default()
        };
        assert!(MotionSegmenter::new(params).is_err());
    }
}
