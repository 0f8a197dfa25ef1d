//! Stereo geometry: calibration, rectification, matching, triangulation.

mod calibration;
mod matcher;
mod rectify;
mod triangulate;

pub use calibration::{Calibration, Distortion};
pub use matcher::{
    pair_score, MatcherParams, StereoMatch, StereoMatcher, MATCH_THRESHOLD, MAX_Y_DIFF,
};
pub use rectify::RectificationMap;
pub use triangulate::{triangulate, Position3};
