//! Frame containers.
//!
//! - `Frame`: one decoded BGR raster with its 1-based stream index and timestamp.
//! - `Roi`: rectangular region of interest, validated at construction.
//! - `GrayImage`: single-channel luminance plane used by the segmenter.
//! - `MarkedFrameBuffer`: bounded ring of frames captured at entry/exit transitions.
//!
//! Frames flow through the pipeline by reference. Only the marked-frame buffer
//! retains copies, and it is capped at `MAX_MARKED_FRAMES`.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

pub use image::GrayImage;

/// Maximum number of transition frames retained for review.
pub const MAX_MARKED_FRAMES: usize = 300;

// ----------------------------------------------------------------------------
// Frame: BGR raster
// ----------------------------------------------------------------------------

/// Decoded video frame. Pixels are packed BGR, row-major, 3 bytes per pixel.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// 1-based position in the stream.
    pub index: u64,
    /// Seconds since stream start (`index / fps`).
    pub timestamp: f64,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("index", &self.index)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, index: u64, timestamp: f64) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} BGR",
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            index,
            timestamp,
        })
    }

    /// Uniform frame filled with one BGR colour.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3], index: u64, timestamp: f64) -> Self {
        let mut data = Vec::with_capacity((width as usize) * (height as usize) * 3);
        for _ in 0..(width as usize) * (height as usize) {
            data.extend_from_slice(&bgr);
        }
        Self {
            data,
            width,
            height,
            index,
            timestamp,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = ((y as usize) * (self.width as usize) + x as usize) * 3;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = ((y as usize) * (self.width as usize) + x as usize) * 3;
        self.data[i..i + 3].copy_from_slice(&bgr);
    }

    /// Luminance of the ROI using BT.601 weights in 14-bit fixed point.
    pub fn to_gray(&self, roi: &Roi) -> Result<GrayImage> {
        if !roi.fits(self.width, self.height) {
            return Err(anyhow!(
                "roi {:?} does not fit inside {}x{} frame",
                roi,
                self.width,
                self.height
            ));
        }
        let mut data = Vec::with_capacity((roi.w as usize) * (roi.h as usize));
        let stride = self.width as usize * 3;
        for y in roi.y..roi.y + roi.h {
            let row = &self.data[y as usize * stride..(y as usize + 1) * stride];
            for x in roi.x..roi.x + roi.w {
                let i = x as usize * 3;
                let (b, g, r) = (row[i] as u32, row[i + 1] as u32, row[i + 2] as u32);
                data.push(((b * 1868 + g * 9617 + r * 4899 + 8192) >> 14) as u8);
            }
        }
        GrayImage::from_raw(roi.w, roi.h, data)
            .ok_or_else(|| anyhow!("luminance plane does not match {}x{} roi", roi.w, roi.h))
    }

    /// Draw a one-pixel rectangle outline, clipped to the frame.
    pub fn draw_box(&mut self, x: i64, y: i64, w: i64, h: i64, bgr: [u8; 3]) {
        let (x1, y1) = (x + w - 1, y + h - 1);
        for px in x..=x1 {
            self.put_clipped(px, y, bgr);
            self.put_clipped(px, y1, bgr);
        }
        for py in y..=y1 {
            self.put_clipped(x, py, bgr);
            self.put_clipped(x1, py, bgr);
        }
    }

    fn put_clipped(&mut self, x: i64, y: i64, bgr: [u8; 3]) {
        if x >= 0 && y >= 0 {
            self.set_pixel(x as u32, y as u32, bgr);
        }
    }

    /// Convert to an RGB image for encoding.
    pub fn to_rgb_image(&self) -> Result<image::RgbImage> {
        let mut rgb = Vec::with_capacity(self.data.len());
        for px in self.data.chunks_exact(3) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        image::RgbImage::from_raw(self.width, self.height, rgb)
            .ok_or_else(|| anyhow!("frame dimensions do not match pixel buffer"))
    }
}

// ----------------------------------------------------------------------------
// Roi
// ----------------------------------------------------------------------------

/// Region of interest in full-frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Result<Self> {
        if w == 0 || h == 0 {
            return Err(anyhow!("roi width and height must be positive"));
        }
        Ok(Self { x, y, w, h })
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            w: width,
            h: height,
        }
    }

    /// Parse `x,y,w,h`.
    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<u32> = value
            .split(',')
            .map(|p| p.trim().parse::<u32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| anyhow!("roi must be four non-negative integers: x,y,w,h"))?;
        match parts.as_slice() {
            [x, y, w, h] => Self::new(*x, *y, *w, *h),
            _ => Err(anyhow!("roi must be four non-negative integers: x,y,w,h")),
        }
    }

    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.w > 0
            && self.h > 0
            && (self.x as u64 + self.w as u64) <= width as u64
            && (self.y as u64 + self.h as u64) <= height as u64
    }
}

// ----------------------------------------------------------------------------
// MarkedFrameBuffer: transition frames for review
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkKind {
    Entry,
    Exit,
}

#[derive(Clone, Debug)]
pub struct MarkedFrame {
    pub frame: Frame,
    pub kind: MarkKind,
    pub event_id: usize,
}

/// Bounded ring buffer of transition frames.
///
/// - Keeps at most `MAX_MARKED_FRAMES` frames
/// - Evicts the oldest frame when full
pub struct MarkedFrameBuffer {
    buffer: VecDeque<MarkedFrame>,
    max_frames: usize,
}

impl MarkedFrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_MARKED_FRAMES)
    }

    pub fn with_capacity(max_frames: usize) -> Self {
        let max_frames = max_frames.clamp(1, MAX_MARKED_FRAMES);
        Self {
            buffer: VecDeque::with_capacity(max_frames),
            max_frames,
        }
    }

    pub fn push(&mut self, marked: MarkedFrame) {
        while self.buffer.len() >= self.max_frames {
            self.buffer.pop_front();
        }
        self.buffer.push_back(marked);
    }

    pub fn latest(&self) -> Option<&MarkedFrame> {
        self.buffer.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarkedFrame> {
        self.buffer.iter()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Write every retained frame as `event_<id>_<kind>_<frame>.jpg` under `dir`.
    pub fn write_jpegs(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create marked frame directory {}", dir.display()))?;
        let mut written = Vec::with_capacity(self.buffer.len());
        for marked in &self.buffer {
            let kind = match marked.kind {
                MarkKind::Entry => "entry",
                MarkKind::Exit => "exit",
            };
            let path = dir.join(format!(
                "event_{:04}_{}_{:06}.jpg",
                marked.event_id, kind, marked.frame.index
            ));
            marked
                .frame
                .to_rgb_image()?
                .save(&path)
                .with_context(|| format!("write marked frame {}", path.display()))?;
            written.push(path);
        }
        Ok(written)
    }
}

impl Default for MarkedFrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
