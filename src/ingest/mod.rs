//! Frame ingestion sources.
//!
//! This module provides sources of decoded frames:
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Synthetic `stub://` scenes with moving bright blobs (tests, demos)
//! - A lockstep stereo pair built from two sources
//!
//! Every source yields frames in order with 1-based indices and timestamps
//! `index / fps`. `Ok(None)` marks the end of the stream; `Err` is an I/O
//! failure that ends the run.
//!
//! The ingestion layer MUST NOT:
//! - Fetch remote URLs
//! - Reorder or drop frames silently

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod stereo;
pub mod synthetic;

pub use file::{FileConfig, FileSource, FileStats};
pub use stereo::{validate_pair, StereoSource, MAX_FPS_DIFF, MAX_FRAME_SKEW};
pub use synthetic::{Flight, SyntheticScene, SyntheticSource, View};

use crate::frame::Frame;

/// Stream properties reported by a source before the first read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoProperties {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// 0 when the container does not report a count.
    pub frame_count: u64,
}

impl VideoProperties {
    pub fn duration_secs(&self) -> f64 {
        if self.fps > 0.0 {
            self.frame_count as f64 / self.fps
        } else {
            0.0
        }
    }
}

/// Sequential frame source.
pub trait FrameSource: Send {
    fn properties(&self) -> &VideoProperties;

    /// Next frame, or `None` at end of stream.
    fn read(&mut self) -> Result<Option<Frame>>;
}

impl FrameSource for Box<dyn FrameSource> {
    fn properties(&self) -> &VideoProperties {
        (**self).properties()
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        (**self).read()
    }
}

/// Acceptance limits applied to a source before a run starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoLimits {
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub min_fps: f64,
    pub max_fps: f64,
    /// Used when the reported frame rate is outside `[min_fps, max_fps]`.
    pub default_fps: f64,
}

impl Default for VideoLimits {
    fn default() -> Self {
        Self {
            min_width: 100,
            min_height: 100,
            max_width: 4096,
            max_height: 4096,
            min_fps: 1.0,
            max_fps: 120.0,
            default_fps: 30.0,
        }
    }
}

/// Check dimensions and frame count; replace an implausible fps with the default.
pub fn validate_properties(props: &VideoProperties, limits: &VideoLimits) -> Result<VideoProperties> {
    if props.width < limits.min_width
        || props.height < limits.min_height
        || props.width > limits.max_width
        || props.height > limits.max_height
    {
        return Err(anyhow!(
            "video size {}x{} is outside the supported range {}x{} .. {}x{}",
            props.width,
            props.height,
            limits.min_width,
            limits.min_height,
            limits.max_width,
            limits.max_height
        ));
    }
    if props.frame_count == 0 {
        return Err(anyhow!("video reports no frames"));
    }
    let mut checked = props.clone();
    if !(props.fps >= limits.min_fps && props.fps <= limits.max_fps) {
        log::warn!(
            "video reports {} fps, using default {} fps",
            props.fps,
            limits.default_fps
        );
        checked.fps = limits.default_fps;
    }
    Ok(checked)
}
