//! Session aggregation: the append-only event list and 3D trajectory.
//!
//! The aggregator is the single owner of results for one run:
//! - At most one event is open at a time
//! - An event is closed once, and only if it was opened
//! - Trajectory points are appended in non-decreasing frame order
//! - Closed events only change through manual validation
//!
//! Exports and snapshots are pure reads.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::events::{Event, ManualValidation, Transition};
use crate::export::{self, ExportFormat};
use crate::frame::Roi;
use crate::stereo::{Position3, StereoMatch};
use crate::DetectionMode;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub confidence: f64,
    pub timestamp: f64,
    pub frame_idx: u64,
}

impl Point3D {
    pub fn new(position: Position3, frame_idx: u64, timestamp: f64) -> Self {
        Self {
            x: position.x,
            y: position.y,
            z: position.z,
            confidence: position.confidence,
            timestamp,
            frame_idx,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    points: Vec<Point3D>,
}

impl Trajectory {
    pub fn push(&mut self, point: Point3D) -> Result<()> {
        if let Some(last) = self.points.last() {
            if point.frame_idx < last.frame_idx {
                return Err(anyhow!(
                    "trajectory point for frame {} arrived after frame {}",
                    point.frame_idx,
                    last.frame_idx
                ));
            }
        }
        self.points.push(point);
        Ok(())
    }

    pub fn points(&self) -> &[Point3D] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Event plus optional stereo measurements.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoEvent {
    #[serde(flatten)]
    pub event: Event,
    pub position_3d: Option<Position3>,
    pub disparity: Option<f64>,
    pub depth_confidence: Option<f64>,
    pub mode: DetectionMode,
}

impl StereoEvent {
    pub fn planar(event: Event, mode: DetectionMode) -> Self {
        Self {
            event,
            position_3d: None,
            disparity: None,
            depth_confidence: None,
            mode,
        }
    }

    pub fn has_stereo(&self) -> bool {
        self.disparity.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub mode: DetectionMode,
    pub left_video: Option<String>,
    pub right_video: Option<String>,
    pub calibration_loaded: bool,
}

/// Row for trajectory visualisation consumers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TrajectoryRow {
    pub frame_idx: u64,
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub confidence: f64,
}

#[derive(Clone, Debug)]
pub struct SessionAggregator {
    metadata: SessionMetadata,
    fps: f64,
    roi: Option<Roi>,
    events: Vec<StereoEvent>,
    open: Option<usize>,
    trajectory: Trajectory,
}

impl SessionAggregator {
    pub fn new(metadata: SessionMetadata, fps: f64) -> Result<Self> {
        crate::events::validate_fps(fps)?;
        Ok(Self {
            metadata,
            fps,
            roi: None,
            events: Vec::new(),
            open: None,
            trajectory: Trajectory::default(),
        })
    }

    /// ROI snapshot stored on every event opened from now on.
    pub fn set_roi(&mut self, roi: Option<Roi>) {
        self.roi = roi;
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Append an event. Its id is reassigned to its position in the list.
    pub fn add(&mut self, mut event: StereoEvent) -> Result<usize> {
        if event.event.is_open() && self.open.is_some() {
            return Err(anyhow!("an event is already open"));
        }
        let id = self.events.len();
        event.event.event_id = id;
        if event.event.is_open() {
            self.open = Some(id);
        }
        self.events.push(event);
        Ok(id)
    }

    /// Apply a state-machine transition. Returns the id of the affected event.
    pub fn apply(&mut self, transition: &Transition) -> Result<usize> {
        match *transition {
            Transition::Entry {
                frame_idx,
                bat_center,
                zone,
                ..
            } => {
                let mut event = Event::open(self.events.len(), frame_idx, self.fps);
                event.bat_center = bat_center;
                event.zone = zone;
                event.roi = self.roi;
                let id = self.add(StereoEvent::planar(event, self.metadata.mode))?;
                log::info!(
                    "event {} opened at frame {} ({:.2}s)",
                    id,
                    frame_idx,
                    self.events[id].event.entry_time
                );
                Ok(id)
            }
            Transition::Exit { frame_idx, .. } => self.close_open_event(frame_idx),
        }
    }

    pub fn close_open_event(&mut self, exit_frame: u64) -> Result<usize> {
        let id = self
            .open
            .ok_or_else(|| anyhow!("no open event to close at frame {}", exit_frame))?;
        let fps = self.fps;
        let event = &mut self.events[id].event;
        event.close(exit_frame, fps)?;
        log::info!(
            "event {} closed at frame {} after {:.2}s",
            id,
            exit_frame,
            event.duration.unwrap_or_default()
        );
        self.open = None;
        Ok(id)
    }

    /// Close a still-open event at the last processed frame.
    pub fn finalize(&mut self, last_frame: u64) -> Result<Option<usize>> {
        if self.open.is_none() {
            return Ok(None);
        }
        self.close_open_event(last_frame).map(Some)
    }

    pub fn open_event(&self) -> Option<&StereoEvent> {
        self.open.map(|id| &self.events[id])
    }

    /// Record an instantaneous 3D event for a stereo match.
    pub fn add_instant(&mut self, m: &StereoMatch, position: Option<Position3>, frame_idx: u64) -> Result<usize> {
        let mut event = Event::open(self.events.len(), frame_idx, self.fps);
        event.bat_center = Some((m.left.cx, m.left.cy));
        event.roi = self.roi;
        event.close(frame_idx, self.fps)?;
        self.add(StereoEvent {
            event,
            position_3d: position,
            disparity: Some(m.disparity),
            depth_confidence: Some(m.depth_confidence),
            mode: self.metadata.mode,
        })
    }

    /// Fill an event's stereo fields. Returns false if they were already set.
    pub fn attach_stereo(
        &mut self,
        event_id: usize,
        m: &StereoMatch,
        position: Option<Position3>,
    ) -> Result<bool> {
        let ev = self
            .events
            .get_mut(event_id)
            .ok_or_else(|| anyhow!("unknown event id {}", event_id))?;
        if ev.has_stereo() {
            return Ok(false);
        }
        ev.disparity = Some(m.disparity);
        ev.depth_confidence = Some(m.depth_confidence);
        ev.position_3d = position;
        Ok(true)
    }

    pub fn push_point(&mut self, point: Point3D) -> Result<()> {
        self.trajectory.push(point)
    }

    pub fn annotate(&mut self, event_id: usize, validation: ManualValidation) -> Result<()> {
        let ev = self
            .events
            .get_mut(event_id)
            .ok_or_else(|| anyhow!("unknown event id {}", event_id))?;
        if ev.event.is_open() {
            return Err(anyhow!("event {} is still open", event_id));
        }
        ev.event.validation = Some(validation);
        Ok(())
    }

    pub fn events(&self) -> &[StereoEvent] {
        &self.events
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn snapshot_events(&self) -> Vec<StereoEvent> {
        self.events.clone()
    }

    pub fn snapshot_trajectory(&self) -> Vec<Point3D> {
        self.trajectory.points.clone()
    }

    pub fn closed_events(&self) -> impl Iterator<Item = &StereoEvent> {
        self.events.iter().filter(|e| !e.event.is_open())
    }

    pub fn trajectory_data(&self) -> Vec<TrajectoryRow> {
        self.trajectory
            .points
            .iter()
            .map(|p| TrajectoryRow {
                frame_idx: p.frame_idx,
                timestamp: p.timestamp,
                x: p.x,
                y: p.y,
                z: p.z,
                confidence: p.confidence,
            })
            .collect()
    }

    pub fn export(&self, format: ExportFormat, path: &Path) -> Result<()> {
        export::write(self, format, path)
    }
}
