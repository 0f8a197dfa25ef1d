//! Synthetic scenes (`stub://`) for tests and demos.
//!
//! A scene is a dark, optionally noisy background with bright disks moving
//! along straight lines. The right view of a stereo pair shows each disk
//! shifted left by its disparity, so a rectified matcher sees positive
//! disparities. Rendering is deterministic for a given seed.

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{FrameSource, VideoProperties};
use crate::frame::Frame;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    #[default]
    Left,
    Right,
}

/// One bat crossing the scene.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Flight {
    pub first_frame: u64,
    pub last_frame: u64,
    /// Centre at `first_frame`.
    pub start: (f64, f64),
    /// Pixels per frame.
    pub velocity: (f64, f64),
    pub radius: f64,
    /// Horizontal offset of the right view.
    pub disparity: f64,
}

impl Flight {
    /// Left-view centre at `index`, if the flight is airborne.
    pub fn position(&self, index: u64) -> Option<(f64, f64)> {
        if index < self.first_frame || index > self.last_frame {
            return None;
        }
        let t = (index - self.first_frame) as f64;
        Some((self.start.0 + self.velocity.0 * t, self.start.1 + self.velocity.1 * t))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyntheticScene {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
    pub background: u8,
    pub brightness: u8,
    /// Uniform noise amplitude added to every pixel.
    pub noise: u8,
    pub seed: u64,
    pub flights: Vec<Flight>,
}

impl SyntheticScene {
    pub fn new(width: u32, height: u32, fps: f64, frame_count: u64) -> Self {
        Self {
            width,
            height,
            fps,
            frame_count,
            background: 12,
            brightness: 230,
            noise: 0,
            seed: 0,
            flights: Vec::new(),
        }
    }

    pub fn with_flight(mut self, flight: Flight) -> Self {
        self.flights.push(flight);
        self
    }

    pub fn with_noise(mut self, noise: u8, seed: u64) -> Self {
        self.noise = noise;
        self.seed = seed;
        self
    }

    /// Bats crossing the middle band one after another, every 120 frames from frame 40.
    pub fn colony(width: u32, height: u32, fps: f64, frame_count: u64) -> Self {
        let mut scene = Self::new(width, height, fps, frame_count);
        let span = 40u64;
        let mut first = 40u64;
        let mut i = 0u32;
        while first + span <= frame_count {
            let lane = 0.4 + 0.1 * (i % 3) as f64;
            scene.flights.push(Flight {
                first_frame: first,
                last_frame: first + span - 1,
                start: (width as f64 * 0.2, height as f64 * lane),
                velocity: (width as f64 * 0.6 / span as f64, 0.25),
                radius: 3.0,
                disparity: 10.0 + 2.0 * (i % 4) as f64,
            });
            first += 120;
            i += 1;
        }
        scene
    }

    pub fn properties(&self) -> VideoProperties {
        VideoProperties {
            width: self.width,
            height: self.height,
            fps: self.fps,
            frame_count: self.frame_count,
        }
    }

    pub fn render(&self, index: u64, view: View) -> Frame {
        let timestamp = index as f64 / self.fps;
        let mut frame = Frame::filled(
            self.width,
            self.height,
            [self.background; 3],
            index,
            timestamp,
        );
        if self.noise > 0 {
            let salt = match view {
                View::Left => 0x5f3a_u64,
                View::Right => 0xa1c7_u64,
            };
            let mut rng = StdRng::seed_from_u64(self.seed ^ index.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ salt);
            let n = self.noise as i16;
            for y in 0..self.height {
                for x in 0..self.width {
                    let v = (self.background as i16 + rng.gen_range(-n..=n)).clamp(0, 255) as u8;
                    frame.set_pixel(x, y, [v; 3]);
                }
            }
        }
        for flight in &self.flights {
            let Some((cx, cy)) = flight.position(index) else {
                continue;
            };
            let cx = match view {
                View::Left => cx,
                View::Right => cx - flight.disparity,
            };
            self.paint_disk(&mut frame, cx, cy, flight.radius);
        }
        frame
    }

    fn paint_disk(&self, frame: &mut Frame, cx: f64, cy: f64, r: f64) {
        let (x0, x1) = ((cx - r).floor().max(0.0) as i64, (cx + r).ceil() as i64);
        let (y0, y1) = ((cy - r).floor().max(0.0) as i64, (cy + r).ceil() as i64);
        for y in y0..=y1 {
            for x in x0..=x1 {
                let (dx, dy) = (x as f64 - cx, y as f64 - cy);
                if dx * dx + dy * dy <= r * r && x < self.width as i64 && y < self.height as i64 {
                    frame.set_pixel(x as u32, y as u32, [self.brightness; 3]);
                }
            }
        }
    }

    /// Parse `stub://<name>?width=..&height=..&fps=..&frames=..&noise=..&seed=..&view=left|right`.
    ///
    /// Every name renders the colony scene. Unknown parameters are rejected.
    pub fn from_url(url: &str) -> Result<(Self, View)> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic source url must start with stub://"))?;
        let (_name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (mut width, mut height, mut fps, mut frames) = (320u32, 240u32, 30.0f64, 600u64);
        let (mut noise, mut seed, mut view) = (0u8, 0u64, View::Left);
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("stub parameter '{}' must be key=value", pair))?;
            let bad = || anyhow!("invalid value '{}' for stub parameter '{}'", value, key);
            match key {
                "width" => width = value.parse().map_err(|_| bad())?,
                "height" => height = value.parse().map_err(|_| bad())?,
                "fps" => fps = value.parse().map_err(|_| bad())?,
                "frames" => frames = value.parse().map_err(|_| bad())?,
                "noise" => noise = value.parse().map_err(|_| bad())?,
                "seed" => seed = value.parse().map_err(|_| bad())?,
                "view" => {
                    view = match value {
                        "left" => View::Left,
                        "right" => View::Right,
                        _ => return Err(bad()),
                    }
                }
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        let scene = Self::colony(width, height, fps, frames).with_noise(noise, seed);
        Ok((scene, view))
    }

    pub fn source(&self, view: View) -> SyntheticSource {
        SyntheticSource::new(self.clone(), view)
    }
}

pub struct SyntheticSource {
    scene: SyntheticScene,
    view: View,
    props: VideoProperties,
    next_index: u64,
    fail_after: Option<u64>,
}

impl SyntheticSource {
    pub fn new(scene: SyntheticScene, view: View) -> Self {
        Self {
            props: scene.properties(),
            scene,
            view,
            next_index: 1,
            fail_after: None,
        }
    }

    /// Simulate a decoder failure once `frames` frames have been delivered.
    pub fn failing_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn frames_delivered(&self) -> u64 {
        self.next_index - 1
    }
}

impl FrameSource for SyntheticSource {
    fn properties(&self) -> &VideoProperties {
        &self.props
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if let Some(limit) = self.fail_after {
            if self.frames_delivered() >= limit {
                return Err(anyhow!(
                    "synthetic decoder failure after {} frames",
                    self.frames_delivered()
                ));
            }
        }
        if self.next_index > self.scene.frame_count {
            return Ok(None);
        }
        let frame = self.scene.render(self.next_index, self.view);
        self.next_index += 1;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_flight() -> SyntheticScene {
        SyntheticScene::new(120, 100, 30.0, 20).with_flight(Flight {
            first_frame: 5,
            last_frame: 10,
            start: (60.0, 50.0),
            velocity: (2.0, 0.0),
            radius: 3.0,
            disparity: 12.0,
        })
    }

    #[test]
    fn frames_are_indexed_from_one_and_end_with_none() {
        let mut src = one_flight().source(View::Left);
        let first = src.read().unwrap().unwrap();
        assert_eq!(first.index, 1);
        assert!((first.timestamp - 1.0 / 30.0).abs() < 1e-12);
        let mut count = 1;
        while src.read().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 20);
        assert!(src.read().unwrap().is_none());
    }

    #[test]
    fn right_view_is_shifted_by_disparity() {
        let scene = one_flight();
        let left = scene.render(7, View::Left);
        let right = scene.render(7, View::Right);
        // Flight centre at frame 7 is (64, 50).
        assert_eq!(left.pixel(64, 50), Some([230; 3]));
        assert_eq!(right.pixel(52, 50), Some([230; 3]));
        assert_eq!(right.pixel(64, 50), Some([12; 3]));
        assert_eq!(scene.render(11, View::Left).pixel(72, 50), Some([12; 3]));
    }

    #[test]
    fn noise_is_deterministic_per_seed() {
        let scene = one_flight().with_noise(3, 42);
        let a = scene.render(2, View::Left);
        let b = scene.render(2, View::Left);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert!(a.as_bytes().iter().all(|&v| (9..=15).contains(&v)));
    }

    #[test]
    fn failure_is_reported_after_limit() {
        let mut src = one_flight().source(View::Left).failing_after(3);
        for _ in 0..3 {
            assert!(src.read().unwrap().is_some());
        }
        assert!(src.read().is_err());
    }

    #[test]
    fn url_parameters() {
        let (scene, view) = SyntheticScene::from_url("stub://roost?width=200&frames=400&view=right&noise=2").unwrap();
        assert_eq!(scene.width, 200);
        assert_eq!(scene.height, 240);
        assert_eq!(scene.frame_count, 400);
        assert_eq!(scene.noise, 2);
        assert_eq!(view, View::Right);
        assert_eq!(scene.flights.len(), 3);
        assert!(SyntheticScene::from_url("stub://roost?bogus=1").is_err());
        assert!(SyntheticScene::from_url("stub://roost?view=up").is_err());
        assert!(SyntheticScene::from_url("file:///tmp/x").is_err());
    }
}
