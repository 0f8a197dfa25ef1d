//! External contour extraction and polygon moments.
//!
//! Borders come from `imageproc::contours::find_contours` (Suzuki-Abe, 8-connected).
//! Only top-level outer borders are kept: hole borders and blobs nested inside
//! another blob's hole are dropped.

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};

#[derive(Clone, Debug, PartialEq)]
pub struct Contour {
    /// Boundary pixels in tracing order.
    pub points: Vec<(i32, i32)>,
    /// Bounding box of the border (x, y, w, h) in mask coordinates.
    pub bbox: (u32, u32, u32, u32),
}

/// Spatial moments of the closed contour polygon.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Moments {
    pub m00: f64,
    pub m10: f64,
    pub m01: f64,
}

impl Moments {
    pub fn area(&self) -> f64 {
        self.m00.abs()
    }

    /// `None` for degenerate (zero-area) contours.
    pub fn centroid(&self) -> Option<(f64, f64)> {
        if self.m00 == 0.0 {
            return None;
        }
        Some((self.m10 / self.m00, self.m01 / self.m00))
    }
}

impl Contour {
    fn from_points(points: Vec<(i32, i32)>) -> Option<Self> {
        let (mut min_x, mut min_y) = *points.first()?;
        let (mut max_x, mut max_y) = (min_x, min_y);
        for &(x, y) in &points {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        Some(Self {
            points,
            bbox: (
                min_x as u32,
                min_y as u32,
                (max_x - min_x + 1) as u32,
                (max_y - min_y + 1) as u32,
            ),
        })
    }

    /// Green's-theorem moments over the polygon through the boundary pixel centres.
    pub fn moments(&self) -> Moments {
        let n = self.points.len();
        if n < 3 {
            return Moments::default();
        }
        let (mut a00, mut a10, mut a01) = (0.0f64, 0.0f64, 0.0f64);
        for i in 0..n {
            let (x0, y0) = self.points[i];
            let (x1, y1) = self.points[(i + 1) % n];
            let (x0, y0, x1, y1) = (x0 as f64, y0 as f64, x1 as f64, y1 as f64);
            let cross = x0 * y1 - x1 * y0;
            a00 += cross;
            a10 += (x0 + x1) * cross;
            a01 += (y0 + y1) * cross;
        }
        Moments {
            m00: a00 / 2.0,
            m10: a10 / 6.0,
            m01: a01 / 6.0,
        }
    }
}

/// Outer contours of every top-level foreground component of `mask`.
pub fn external_contours(mask: &GrayImage) -> Vec<Contour> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter_map(|c| Contour::from_points(c.points.into_iter().map(|p| (p.x, p.y)).collect()))
        .collect()
}
