//! Undistort + rectify remapping.
//!
//! For each destination pixel the map stores where to sample the raw image:
//! back-project through the rectified projection, undo the rectifying
//! rotation, apply lens distortion, and project with the raw intrinsics.
//! Maps are built once per frame size and reused for every frame.

use anyhow::{anyhow, Result};
use nalgebra::{Matrix3, Matrix3x4};

use super::calibration::{Calibration, Distortion};
use crate::frame::Frame;

/// Tolerance for samples that land a rounding error outside the image.
const EDGE_EPS: f32 = 1e-3;

#[derive(Clone, Debug)]
pub struct RectificationMap {
    width: u32,
    height: u32,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
}

impl RectificationMap {
    pub fn build(
        camera: &Matrix3<f64>,
        dist: &Distortion,
        rectification: &Matrix3<f64>,
        projection: &Matrix3x4<f64>,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("rectification map needs a non-empty frame size"));
        }
        let new_camera: Matrix3<f64> = projection.fixed_view::<3, 3>(0, 0).into_owned();
        let inv = (new_camera * rectification)
            .try_inverse()
            .ok_or_else(|| anyhow!("rectification projection is singular"))?;
        let (fx, fy) = (camera[(0, 0)], camera[(1, 1)]);
        let (u0, v0) = (camera[(0, 2)], camera[(1, 2)]);
        let skew = camera[(0, 1)];

        let n = (width as usize) * (height as usize);
        let mut map_x = Vec::with_capacity(n);
        let mut map_y = Vec::with_capacity(n);
        for v in 0..height {
            for u in 0..width {
                let (u, v) = (u as f64, v as f64);
                let x = inv[(0, 0)] * u + inv[(0, 1)] * v + inv[(0, 2)];
                let y = inv[(1, 0)] * u + inv[(1, 1)] * v + inv[(1, 2)];
                let w = inv[(2, 0)] * u + inv[(2, 1)] * v + inv[(2, 2)];
                if w == 0.0 {
                    map_x.push(-1.0);
                    map_y.push(-1.0);
                    continue;
                }
                let (x, y) = (x / w, y / w);
                let r2 = x * x + y * y;
                let radial = 1.0 + r2 * (dist.k1 + r2 * (dist.k2 + r2 * dist.k3));
                let xd = x * radial + 2.0 * dist.p1 * x * y + dist.p2 * (r2 + 2.0 * x * x);
                let yd = y * radial + dist.p1 * (r2 + 2.0 * y * y) + 2.0 * dist.p2 * x * y;
                map_x.push((fx * xd + skew * yd + u0) as f32);
                map_y.push((fy * yd + v0) as f32);
            }
        }
        Ok(Self {
            width,
            height,
            map_x,
            map_y,
        })
    }

    /// Left and right maps for frames of the given size.
    pub fn pair(cal: &Calibration, width: u32, height: u32) -> Result<(Self, Self)> {
        let left = Self::build(
            &cal.camera_matrix_left,
            &cal.dist_coeffs_left,
            &cal.rectification_left,
            &cal.projection_left,
            width,
            height,
        )?;
        let right = Self::build(
            &cal.camera_matrix_right,
            &cal.dist_coeffs_right,
            &cal.rectification_right,
            &cal.projection_right,
            width,
            height,
        )?;
        Ok((left, right))
    }

    pub fn source_of(&self, x: u32, y: u32) -> Option<(f32, f32)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize) * (self.width as usize) + x as usize;
        Some((self.map_x[i], self.map_y[i]))
    }

    /// Bilinear remap. Samples falling outside the source become black.
    pub fn remap(&self, src: &Frame) -> Result<Frame> {
        if src.width != self.width || src.height != self.height {
            return Err(anyhow!(
                "rectification map is {}x{}, frame is {}x{}",
                self.width,
                self.height,
                src.width,
                src.height
            ));
        }
        let (w, h) = (self.width as i64, self.height as i64);
        let bytes = src.as_bytes();
        let mut out = vec![0u8; bytes.len()];
        let (max_x, max_y) = ((w - 1) as f32, (h - 1) as f32);
        for (i, (&sx, &sy)) in self.map_x.iter().zip(&self.map_y).enumerate() {
            if !(sx >= -EDGE_EPS && sy >= -EDGE_EPS && sx <= max_x + EDGE_EPS && sy <= max_y + EDGE_EPS) {
                continue;
            }
            let (sx, sy) = (sx.clamp(0.0, max_x), sy.clamp(0.0, max_y));
            let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
            let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);
            let x1 = (x0 + 1).min(w - 1);
            let y1 = (y0 + 1).min(h - 1);
            let at = |x: i64, y: i64, c: usize| bytes[((y * w + x) * 3) as usize + c] as f32;
            for c in 0..3 {
                let top = at(x0, y0, c) * (1.0 - fx) + at(x1, y0, c) * fx;
                let bottom = at(x0, y1, c) * (1.0 - fx) + at(x1, y1, c) * fx;
                out[i * 3 + c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
            }
        }
        Frame::new(out, src.width, src.height, src.index, src.timestamp)
    }
}
