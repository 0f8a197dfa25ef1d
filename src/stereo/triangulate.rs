use nalgebra::{Matrix4, Vector4};
use serde::{Deserialize, Serialize};

/// Reprojected point in the calibration's length unit.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub confidence: f64,
}

/// Reproject pixel `(x, y)` with `disparity` through `q`.
///
/// Returns `None` for points at infinity (`W == 0`) or non-finite results.
pub fn triangulate(x: f64, y: f64, disparity: f64, q: &Matrix4<f64>) -> Option<Position3> {
    let h = q * Vector4::new(x, y, disparity, 1.0);
    let w = h[3];
    if w == 0.0 {
        return None;
    }
    let p = Position3 {
        x: h[0] / w,
        y: h[1] / w,
        z: h[2] / w,
        confidence: 1.0,
    };
    if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
        return None;
    }
    Some(p)
}
