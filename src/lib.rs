//! Bat Tracker
//!
//! This crate detects bats crossing a monitored opening in infrared video and,
//! with a synchronized stereo rig, turns those crossings into 3D trajectory
//! points.
//!
//! # Architecture
//!
//! ```text
//! FrameSource ──> MotionSegmenter ──> EventStateMachine ──> SessionAggregator
//! FrameSource ×2 ──> MotionSegmenter ×2 ──> StereoMatcher ──> triangulate ──┘
//! ```
//!
//! Processing is sequential and frame-ordered. Background models are explicit
//! per-stream state, so two streams never share a model.
//!
//! # Module Structure
//!
//! - `frame`: BGR frames, ROI, grayscale conversion, marked-frame buffer
//! - `ingest`: frame sources (local files, synthetic scenes, stereo pairs)
//! - `detect`: background subtraction, morphology, contours, candidates
//! - `events`: temporal stabilization and the entry/exit state machine
//! - `zone`: polygon zones gating entries
//! - `stereo`: calibration, rectification, matching, triangulation
//! - `session`: event list and trajectory aggregation
//! - `export`: JSON / CSV / PLY writers
//! - `pipeline`: per-frame 2D and stereo detectors
//! - `runner`: worker thread, cancellation, progress, failure payloads
//! - `config`: layered configuration

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod config;
pub mod detect;
pub mod events;
pub mod export;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod runner;
pub mod session;
pub mod stereo;
pub mod zone;

pub use detect::{DetectionCandidate, MotionDetector, MotionSegmenter, SegmenterParams};
pub use events::{Event, EventParams, EventStateMachine, StabilizationRule, Transition};
pub use export::ExportFormat;
pub use frame::{Frame, GrayImage, MarkedFrameBuffer, Roi};
pub use ingest::{FileConfig, FileSource, FrameSource, StereoSource, VideoProperties};
pub use pipeline::{PlanarDetector, StereoDetector};
pub use runner::{AnalysisSummary, DetectionJob, RunFailure, RunHandle, RunOptions, RunOutcome};
pub use session::{Point3D, SessionAggregator, StereoEvent};
pub use stereo::{Calibration, StereoMatch, StereoMatcher};
pub use zone::{PolygonZone, ZoneSet};

// -------------------- Detection Mode --------------------

/// How a session produces events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionMode {
    /// Single-stream entry/exit events.
    #[default]
    #[serde(rename = "2d")]
    TwoD,
    /// Every accepted stereo match is an instantaneous event.
    #[serde(rename = "3d")]
    ThreeD,
    /// Entry/exit events from the left stream, enriched with stereo depth.
    #[serde(rename = "hybrid")]
    Hybrid,
}

impl DetectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionMode::TwoD => "2d",
            DetectionMode::ThreeD => "3d",
            DetectionMode::Hybrid => "hybrid",
        }
    }

    pub fn requires_calibration(self) -> bool {
        match self {
            DetectionMode::TwoD => false,
            DetectionMode::ThreeD | DetectionMode::Hybrid => true,
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "2d" => Ok(DetectionMode::TwoD),
            "3d" => Ok(DetectionMode::ThreeD),
            "hybrid" => Ok(DetectionMode::Hybrid),
            other => Err(anyhow!("unknown detection mode '{}' (2d|3d|hybrid)", other)),
        }
    }
}
