//! Binary morphology on 0/255 masks, backed by `imageproc` grayscale operators.
//!
//! On a 0/255 mask grayscale min/max is binary erode/dilate. Out-of-image
//! neighbours are ignored, so borders neither erode nor grow blobs.

use anyhow::{anyhow, Result};
use image::{GrayImage, Luma};
use imageproc::morphology::{grayscale_close, grayscale_open, Mask};

/// Largest element whose anchor still fits the mask's `u8` centre.
pub const MAX_ELEMENT_SIZE: u32 = 255;

/// Elliptical structuring element inscribed in a `size`×`size` box.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructuringElement {
    size: u32,
    offsets: Vec<(i32, i32)>,
}

impl StructuringElement {
    /// Ellipse anchored at the box centre, rasterised row by row.
    pub fn ellipse(size: u32) -> Result<Self> {
        if size == 0 || size > MAX_ELEMENT_SIZE {
            return Err(anyhow!(
                "structuring element size must be in 1..={} (got {})",
                MAX_ELEMENT_SIZE,
                size
            ));
        }
        let r = (size / 2) as i32;
        let inv_r2 = if r > 0 { 1.0 / (r * r) as f64 } else { 0.0 };
        let mut offsets = Vec::new();
        for i in 0..size as i32 {
            let dy = i - r;
            if dy.abs() > r {
                continue;
            }
            let dx = (r as f64 * (((r * r - dy * dy) as f64) * inv_r2).sqrt()).round() as i32;
            let j1 = (r - dx).max(0);
            let j2 = (r + dx + 1).min(size as i32);
            for j in j1..j2 {
                offsets.push((j - r, dy));
            }
        }
        Ok(Self { size, offsets })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn offsets(&self) -> &[(i32, i32)] {
        &self.offsets
    }

    fn mask(&self) -> Mask {
        let mut kernel = GrayImage::new(self.size, self.size);
        let c = (self.size / 2) as i32;
        for &(dx, dy) in &self.offsets {
            kernel.put_pixel((c + dx) as u32, (c + dy) as u32, Luma([255]));
        }
        Mask::from_image(&kernel, c as u8, c as u8)
    }
}

/// Erode then dilate: removes specks smaller than the element.
pub fn open(mask: &GrayImage, se: &StructuringElement) -> GrayImage {
    grayscale_open(mask, &se.mask())
}

/// Dilate then erode: bridges gaps narrower than the element.
pub fn close(mask: &GrayImage, se: &StructuringElement) -> GrayImage {
    grayscale_close(mask, &se.mask())
}

#[cfg(test)]
pub(crate) fn mask_from(rows: &[&str]) -> GrayImage {
    let h = rows.len() as u32;
    let w = rows[0].len() as u32;
    let data = rows
        .iter()
        .flat_map(|r| r.bytes().map(|b| if b == b'#' { 255 } else { 0 }))
        .collect();
    GrayImage::from_raw(w, h, data).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(mask: &GrayImage) -> usize {
        mask.as_raw().iter().filter(|&&v| v != 0).count()
    }

    #[test]
    fn three_by_three_ellipse_is_a_cross() {
        let se = StructuringElement::ellipse(3).unwrap();
        let mut offsets = se.offsets().to_vec();
        offsets.sort();
        assert_eq!(offsets, vec![(-1, 0), (0, -1), (0, 0), (0, 1), (1, 0)]);
    }

    #[test]
    fn five_by_five_ellipse_shape() {
        let se = StructuringElement::ellipse(5).unwrap();
        // Rows: 1, 5, 5, 5, 1 cells.
        assert_eq!(se.offsets().len(), 17);
        assert!(StructuringElement::ellipse(0).is_err());
        assert!(StructuringElement::ellipse(MAX_ELEMENT_SIZE + 1).is_err());
    }

    #[test]
    fn opening_removes_isolated_pixels() {
        let mask = mask_from(&[
            ".......", //
            ".#.....", //
            ".....#.", //
            "....###", //
            ".....#.", //
        ]);
        let se = StructuringElement::ellipse(3).unwrap();
        let opened = open(&mask, &se);
        assert_eq!(opened.get_pixel(1, 1)[0], 0);
        // The cross survives opening with a cross element.
        assert_eq!(opened.get_pixel(5, 3)[0], 255);
        assert_eq!(lit(&opened), 5);
    }

    #[test]
    fn closing_bridges_single_pixel_gap() {
        let mask = mask_from(&[
            "##.##", //
            "##.##", //
            "##.##", //
        ]);
        let se = StructuringElement::ellipse(3).unwrap();
        let closed = close(&mask, &se);
        assert_eq!(closed.get_pixel(2, 1)[0], 255);
    }

    #[test]
    fn opening_keeps_a_solid_disc() {
        let mut mask = GrayImage::new(20, 20);
        for y in 5..15u32 {
            for x in 5..15u32 {
                let (dx, dy) = (x as f64 - 9.5, y as f64 - 9.5);
                if dx * dx + dy * dy <= 16.0 {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
        }
        let se = StructuringElement::ellipse(3).unwrap();
        assert_eq!(open(&mask, &se), mask);
    }
}
