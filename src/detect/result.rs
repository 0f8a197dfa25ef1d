use serde::{Deserialize, Serialize};

/// Default lower bound (exclusive) on blob area in pixels.
pub const MIN_AREA: f64 = 5.0;
/// Default upper bound (exclusive) on blob area in pixels.
pub const MAX_AREA: f64 = 100.0;

/// One foreground blob that survived the area filter.
///
/// Coordinates are full-frame pixels. Valid only for the frame it was produced from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionCandidate {
    pub cx: f64,
    pub cy: f64,
    pub area: f64,
    /// Bounding box of the outer contour (x, y, w, h).
    pub bbox: (u32, u32, u32, u32),
}

/// Open interval (min, max) of accepted blob areas.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AreaRange {
    pub min: f64,
    pub max: f64,
}

impl AreaRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, area: f64) -> bool {
        area > self.min && area < self.max
    }
}

impl Default for AreaRange {
    fn default() -> Self {
        Self {
            min: MIN_AREA,
            max: MAX_AREA,
        }
    }
}

/// Largest candidate by area; ties keep the first one found.
pub fn primary(candidates: &[DetectionCandidate]) -> Option<&DetectionCandidate> {
    candidates.iter().fold(None, |best, c| match best {
        Some(b) if b.area >= c.area => Some(b),
        _ => Some(c),
    })
}
