//! Entry/exit event detection.
//!
//! Converts the per-frame "motion present" signal into discrete transitions:
//! - `MotionHistory` keeps the last `window` raw samples and decides whether
//!   motion is stabilized (strict majority).
//! - `EventStateMachine` tracks OUTSIDE/INSIDE and enforces a cooldown after
//!   every transition. Frames spent counting the cooldown down never transition.
//!
//! The machine only reports transitions. Event records are built and owned by
//! the session aggregator.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::frame::Roi;
use crate::zone::ZoneSet;

/// Default stabilization window in frames.
pub const WINDOW_SIZE: usize = 15;
/// Default frames a transition blocks further transitions.
pub const COOLDOWN_FRAMES: u32 = 15;

// ----------------------------------------------------------------------------
// MotionHistory
// ----------------------------------------------------------------------------

/// Majority threshold used while deciding stabilization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilizationRule {
    /// More than `window / 2` true samples, even while the window is still filling.
    #[default]
    FullWindow,
    /// More than `len / 2` true samples over the samples seen so far.
    CurrentLength,
}

#[derive(Clone, Debug)]
pub struct MotionHistory {
    samples: VecDeque<bool>,
    capacity: usize,
    rule: StabilizationRule,
}

impl MotionHistory {
    pub fn new(capacity: usize, rule: StabilizationRule) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            rule,
        }
    }

    pub fn push(&mut self, motion: bool) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(motion);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn count(&self) -> usize {
        self.samples.iter().filter(|&&m| m).count()
    }

    pub fn is_stabilized(&self) -> bool {
        let basis = match self.rule {
            StabilizationRule::FullWindow => self.capacity,
            StabilizationRule::CurrentLength => self.samples.len(),
        };
        !self.samples.is_empty() && self.count() > basis / 2
    }
}

// ----------------------------------------------------------------------------
// Event record
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Confirmed,
    Rejected,
    Uncertain,
}

/// Manual review annotation. The only change allowed on a closed event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManualValidation {
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: usize,
    pub entry_time: f64,
    pub exit_time: Option<f64>,
    pub duration: Option<f64>,
    /// Frame index at entry.
    pub frame_idx: u64,
    pub exit_frame: Option<u64>,
    pub bat_center: Option<(f64, f64)>,
    pub roi: Option<Roi>,
    /// Index of the polygon zone that admitted the entry.
    pub zone: Option<usize>,
    pub validation: Option<ManualValidation>,
}

impl Event {
    pub fn open(event_id: usize, frame_idx: u64, fps: f64) -> Self {
        Self {
            event_id,
            entry_time: frame_idx as f64 / fps,
            exit_time: None,
            duration: None,
            frame_idx,
            exit_frame: None,
            bat_center: None,
            roi: None,
            zone: None,
            validation: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }

    /// Close at `exit_frame`. Errors if already closed.
    pub fn close(&mut self, exit_frame: u64, fps: f64) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("event {} is already closed", self.event_id));
        }
        let exit = exit_frame as f64 / fps;
        self.exit_time = Some(exit);
        self.exit_frame = Some(exit_frame);
        self.duration = Some((exit - self.entry_time).max(0.0));
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// EventStateMachine
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    #[default]
    Outside,
    Inside,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Transition {
    Entry {
        frame_idx: u64,
        time: f64,
        bat_center: Option<(f64, f64)>,
        zone: Option<usize>,
    },
    Exit {
        frame_idx: u64,
        time: f64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventParams {
    pub window: usize,
    pub cooldown_frames: u32,
    pub rule: StabilizationRule,
}

impl Default for EventParams {
    fn default() -> Self {
        Self {
            window: WINDOW_SIZE,
            cooldown_frames: COOLDOWN_FRAMES,
            rule: StabilizationRule::default(),
        }
    }
}

impl EventParams {
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(anyhow!("stabilization window must be at least one frame"));
        }
        Ok(())
    }
}

/// Checks that a frame rate can be used to time events.
pub fn validate_fps(fps: f64) -> Result<()> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(anyhow!("fps must be a positive number, got {}", fps));
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct EventStateMachine {
    params: EventParams,
    fps: f64,
    history: MotionHistory,
    presence: Presence,
    cooldown: u32,
    zones: ZoneSet,
}

impl EventStateMachine {
    pub fn new(params: EventParams, fps: f64) -> Result<Self> {
        params.validate()?;
        validate_fps(fps)?;
        Ok(Self {
            history: MotionHistory::new(params.window, params.rule),
            params,
            fps,
            presence: Presence::Outside,
            cooldown: 0,
            zones: ZoneSet::default(),
        })
    }

    pub fn with_zones(mut self, zones: ZoneSet) -> Self {
        self.zones = zones;
        self
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    pub fn cooldown(&self) -> u32 {
        self.cooldown
    }

    pub fn history(&self) -> &MotionHistory {
        &self.history
    }

    /// Feed one frame. `bat_center` is the primary candidate's centre, if any.
    pub fn step(
        &mut self,
        frame_idx: u64,
        raw_motion: bool,
        bat_center: Option<(f64, f64)>,
    ) -> Option<Transition> {
        self.history.push(raw_motion);
        let stabilized = self.history.is_stabilized();

        if self.cooldown > 0 {
            self.cooldown -= 1;
            return None;
        }

        let time = frame_idx as f64 / self.fps;
        match (self.presence, stabilized) {
            (Presence::Outside, true) => {
                // Zones only judge entries that have a centre to test.
                let zone = match bat_center {
                    Some((x, y)) if !self.zones.is_empty() => match self.zones.locate(x, y) {
                        Some(zone) => Some(zone),
                        None => {
                            log::debug!("frame {frame_idx}: entry outside every zone ignored");
                            return None;
                        }
                    },
                    _ => None,
                };
                self.presence = Presence::Inside;
                self.cooldown = self.params.cooldown_frames;
                Some(Transition::Entry {
                    frame_idx,
                    time,
                    bat_center,
                    zone,
                })
            }
            (Presence::Inside, false) => {
                self.presence = Presence::Outside;
                self.cooldown = self.params.cooldown_frames;
                Some(Transition::Exit { frame_idx, time })
            }
            _ => None,
        }
    }
}
