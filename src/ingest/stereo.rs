//! Lockstep left/right source.

use anyhow::{anyhow, Result};

use super::{FrameSource, VideoProperties};
use crate::frame::Frame;

/// Largest tolerated difference in reported frame counts.
pub const MAX_FRAME_SKEW: u64 = 5;
/// Largest tolerated difference in reported frame rates.
pub const MAX_FPS_DIFF: f64 = 0.1;

/// Check that two streams can be processed as a synchronized pair.
pub fn validate_pair(left: &VideoProperties, right: &VideoProperties) -> Result<()> {
    if left.width != right.width || left.height != right.height {
        return Err(anyhow!(
            "stereo resolution mismatch: left {}x{}, right {}x{}",
            left.width,
            left.height,
            right.width,
            right.height
        ));
    }
    let fps_diff = (left.fps - right.fps).abs();
    if !(fps_diff <= MAX_FPS_DIFF) {
        return Err(anyhow!(
            "stereo frame rate mismatch: left {} fps, right {} fps",
            left.fps,
            right.fps
        ));
    }
    let skew = left.frame_count.abs_diff(right.frame_count);
    if skew > MAX_FRAME_SKEW {
        return Err(anyhow!(
            "stereo frame count mismatch: left {}, right {} (max skew {})",
            left.frame_count,
            right.frame_count,
            MAX_FRAME_SKEW
        ));
    }
    if skew > 0 {
        log::warn!(
            "stereo frame counts differ by {}; pairing stops at the shorter stream",
            skew
        );
    }
    Ok(())
}

pub struct StereoSource {
    left: Box<dyn FrameSource>,
    right: Box<dyn FrameSource>,
    props: VideoProperties,
}

impl StereoSource {
    pub fn new(left: Box<dyn FrameSource>, right: Box<dyn FrameSource>) -> Result<Self> {
        validate_pair(left.properties(), right.properties())?;
        let mut props = left.properties().clone();
        props.frame_count = props.frame_count.min(right.properties().frame_count);
        Ok(Self { left, right, props })
    }

    /// Left properties with the frame count of the shorter stream.
    pub fn properties(&self) -> &VideoProperties {
        &self.props
    }

    /// Next synchronized pair, or `None` once either stream ends.
    pub fn read_pair(&mut self) -> Result<Option<(Frame, Frame)>> {
        let Some(left) = self.left.read()? else {
            return Ok(None);
        };
        let Some(right) = self.right.read()? else {
            return Ok(None);
        };
        Ok(Some((left, right)))
    }
}
