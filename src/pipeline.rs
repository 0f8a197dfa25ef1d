//! Per-frame detection pipelines.
//!
//! `PlanarDetector` runs one stream through a motion detector and the event
//! state machine and records transitions in its session. `StereoDetector`
//! wraps a planar detector for the left stream, adds a right-stream detector,
//! and turns left/right matches into depth according to the detection mode.
//!
//! Both are driven one frame (or frame pair) at a time, in stream order.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::detect::{primary, DetectionCandidate, MotionDetector};
use crate::events::{EventStateMachine, Transition};
use crate::frame::{Frame, MarkKind, MarkedFrame, MarkedFrameBuffer, Roi};
use crate::session::{Point3D, SessionAggregator};
use crate::stereo::{
    triangulate, Calibration, Position3, RectificationMap, StereoMatch, StereoMatcher,
};
use crate::DetectionMode;

const ENTRY_COLOUR: [u8; 3] = [0, 255, 0];
const EXIT_COLOUR: [u8; 3] = [0, 0, 255];
/// Margin drawn around the primary candidate on marked frames.
const MARK_MARGIN: i64 = 4;

/// What happened on one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReport {
    pub frame_idx: u64,
    pub timestamp: f64,
    /// Qualifying candidates of the left (or only) stream.
    pub candidates: Vec<DetectionCandidate>,
    /// Largest candidate, if any.
    pub primary: Option<DetectionCandidate>,
    pub transition: Option<Transition>,
    /// Event touched by this frame (transition, instant event or stereo attach).
    pub event_id: Option<usize>,
    pub matches: Vec<StereoMatch>,
    /// Trajectory points appended on this frame.
    pub points: Vec<Point3D>,
}

impl FrameReport {
    /// Time is taken from the run's fps, not the decoder's stamp.
    fn new(frame: &Frame, fps: f64) -> Self {
        Self {
            frame_idx: frame.index,
            timestamp: frame.index as f64 / fps,
            ..Self::default()
        }
    }

    pub fn has_motion(&self) -> bool {
        !self.candidates.is_empty()
    }
}

// ----------------------------------------------------------------------------
// PlanarDetector
// ----------------------------------------------------------------------------

pub struct PlanarDetector {
    detector: Box<dyn MotionDetector>,
    machine: EventStateMachine,
    session: SessionAggregator,
    roi: Roi,
    marked: Option<MarkedFrameBuffer>,
}

impl PlanarDetector {
    pub fn new(
        detector: Box<dyn MotionDetector>,
        machine: EventStateMachine,
        mut session: SessionAggregator,
        roi: Roi,
    ) -> Result<Self> {
        if (machine.fps() - session.fps()).abs() > f64::EPSILON {
            return Err(anyhow!(
                "state machine runs at {} fps but the session at {} fps",
                machine.fps(),
                session.fps()
            ));
        }
        session.set_roi(Some(roi));
        log::debug!("planar detector using '{}' backend, roi {:?}", detector.name(), roi);
        Ok(Self {
            detector,
            machine,
            session,
            roi,
            marked: None,
        })
    }

    /// Keep annotated copies of transition frames, at most `capacity`.
    pub fn with_marked_frames(mut self, capacity: usize) -> Self {
        self.marked = Some(MarkedFrameBuffer::with_capacity(capacity));
        self
    }

    pub fn roi(&self) -> &Roi {
        &self.roi
    }

    pub fn machine(&self) -> &EventStateMachine {
        &self.machine
    }

    pub fn session(&self) -> &SessionAggregator {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionAggregator {
        &mut self.session
    }

    pub fn marked_frames(&self) -> Option<&MarkedFrameBuffer> {
        self.marked.as_ref()
    }

    pub fn into_parts(self) -> (SessionAggregator, Option<MarkedFrameBuffer>) {
        (self.session, self.marked)
    }

    fn check_roi(&self, frame: &Frame) -> Result<()> {
        if !self.roi.fits(frame.width, frame.height) {
            return Err(anyhow!(
                "roi {:?} does not fit inside {}x{} frame {}",
                self.roi,
                frame.width,
                frame.height,
                frame.index
            ));
        }
        Ok(())
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionCandidate>> {
        self.check_roi(frame)?;
        self.detector.detect(frame, &self.roi)
    }

    /// Segment one frame and advance the state machine.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<FrameReport> {
        let candidates = self.detect(frame)?;
        self.advance(frame, candidates)
    }

    fn advance(&mut self, frame: &Frame, candidates: Vec<DetectionCandidate>) -> Result<FrameReport> {
        let mut report = FrameReport::new(frame, self.session.fps());
        report.primary = primary(&candidates).copied();
        let centre = report.primary.map(|c| (c.cx, c.cy));
        report.transition = self.machine.step(frame.index, !candidates.is_empty(), centre);
        report.candidates = candidates;

        if let Some(transition) = report.transition {
            let id = self.session.apply(&transition)?;
            report.event_id = Some(id);
            self.mark(frame, &transition, id, report.primary.as_ref());
        }
        Ok(report)
    }

    fn mark(
        &mut self,
        frame: &Frame,
        transition: &Transition,
        event_id: usize,
        primary: Option<&DetectionCandidate>,
    ) {
        let Some(buffer) = self.marked.as_mut() else {
            return;
        };
        let (kind, colour) = match transition {
            Transition::Entry { .. } => (MarkKind::Entry, ENTRY_COLOUR),
            Transition::Exit { .. } => (MarkKind::Exit, EXIT_COLOUR),
        };
        let mut copy = frame.clone();
        copy.draw_box(
            self.roi.x as i64,
            self.roi.y as i64,
            self.roi.w as i64,
            self.roi.h as i64,
            [255, 255, 0],
        );
        if let Some(c) = primary {
            let (x, y, w, h) = c.bbox;
            copy.draw_box(
                x as i64 - MARK_MARGIN,
                y as i64 - MARK_MARGIN,
                w as i64 + 2 * MARK_MARGIN,
                h as i64 + 2 * MARK_MARGIN,
                colour,
            );
        }
        buffer.push(MarkedFrame {
            frame: copy,
            kind,
            event_id,
        });
    }

    /// Close an event still open after `last_frame`.
    pub fn finalize(&mut self, last_frame: u64) -> Result<Option<usize>> {
        self.session.finalize(last_frame)
    }
}

// ----------------------------------------------------------------------------
// StereoDetector
// ----------------------------------------------------------------------------

pub struct StereoDetector {
    planar: PlanarDetector,
    right: Box<dyn MotionDetector>,
    matcher: StereoMatcher,
    calibration: Option<Arc<Calibration>>,
    rectify: Option<(RectificationMap, RectificationMap)>,
    mode: DetectionMode,
}

impl StereoDetector {
    pub fn new(
        planar: PlanarDetector,
        right: Box<dyn MotionDetector>,
        matcher: StereoMatcher,
        calibration: Option<Arc<Calibration>>,
        mode: DetectionMode,
    ) -> Result<Self> {
        if mode.requires_calibration() && calibration.is_none() {
            return Err(anyhow!("{} detection requires a stereo calibration", mode));
        }
        if planar.session().metadata().mode != mode {
            return Err(anyhow!(
                "session is tagged '{}' but the detector runs in '{}' mode",
                planar.session().metadata().mode,
                mode
            ));
        }
        Ok(Self {
            planar,
            right,
            matcher,
            calibration,
            rectify: None,
            mode,
        })
    }

    /// Remap both streams through the calibration before segmentation.
    pub fn with_rectification(mut self, width: u32, height: u32) -> Result<Self> {
        let cal = self
            .calibration
            .as_ref()
            .ok_or_else(|| anyhow!("rectification requires a stereo calibration"))?;
        self.rectify = Some(RectificationMap::pair(cal, width, height)?);
        log::info!("stereo rectification maps built for {}x{}", width, height);
        Ok(self)
    }

    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    pub fn planar(&self) -> &PlanarDetector {
        &self.planar
    }

    pub fn planar_mut(&mut self) -> &mut PlanarDetector {
        &mut self.planar
    }

    pub fn session(&self) -> &SessionAggregator {
        self.planar.session()
    }

    pub fn into_planar(self) -> PlanarDetector {
        self.planar
    }

    pub fn process_pair(&mut self, left: &Frame, right: &Frame) -> Result<FrameReport> {
        if left.index != right.index {
            return Err(anyhow!(
                "stereo frames out of step: left {}, right {}",
                left.index,
                right.index
            ));
        }
        let rectified = match &self.rectify {
            Some((map_l, map_r)) => Some((map_l.remap(left)?, map_r.remap(right)?)),
            None => None,
        };
        let (left, right) = match &rectified {
            Some((l, r)) => (l, r),
            None => (left, right),
        };

        match self.mode {
            DetectionMode::TwoD => self.planar.process_frame(left),
            DetectionMode::ThreeD => self.process_instant(left, right),
            DetectionMode::Hybrid => self.process_hybrid(left, right),
        }
    }

    fn stereo_candidates(
        &mut self,
        left: &Frame,
        right: &Frame,
    ) -> Result<(Vec<DetectionCandidate>, Vec<StereoMatch>)> {
        let left_candidates = self.planar.detect(left)?;
        let roi = self.planar.roi;
        let right_candidates = self.right.detect(right, &roi)?;
        let matches = self
            .matcher
            .match_candidates(&left_candidates, &right_candidates);
        if !left_candidates.is_empty() && matches.is_empty() {
            log::debug!(
                "frame {}: {} left / {} right candidates, no match",
                left.index,
                left_candidates.len(),
                right_candidates.len()
            );
        }
        Ok((left_candidates, matches))
    }

    fn triangulate(&self, m: &StereoMatch) -> Option<Position3> {
        let cal = self.calibration.as_ref()?;
        let position = triangulate(m.left.cx, m.left.cy, m.disparity, &cal.q);
        if position.is_none() {
            log::debug!("match at ({:.1}, {:.1}) has no finite depth", m.left.cx, m.left.cy);
        }
        position
    }

    fn process_instant(&mut self, left: &Frame, right: &Frame) -> Result<FrameReport> {
        let (candidates, matches) = self.stereo_candidates(left, right)?;
        let mut report = FrameReport::new(left, self.planar.session().fps());
        report.primary = primary(&candidates).copied();
        report.candidates = candidates;
        for m in &matches {
            let position = self.triangulate(m);
            let session = self.planar.session_mut();
            let id = session.add_instant(m, position, left.index)?;
            report.event_id = Some(id);
            if let Some(p) = position {
                let point = Point3D::new(p, left.index, report.timestamp);
                session.push_point(point)?;
                report.points.push(point);
            }
        }
        report.matches = matches;
        Ok(report)
    }

    fn process_hybrid(&mut self, left: &Frame, right: &Frame) -> Result<FrameReport> {
        let (candidates, matches) = self.stereo_candidates(left, right)?;
        let mut report = self.planar.advance(left, candidates)?;

        let mut best: Option<(&StereoMatch, Option<Position3>)> = None;
        for m in &matches {
            let position = self.triangulate(m);
            if let Some(p) = position {
                let point = Point3D::new(p, left.index, report.timestamp);
                self.planar.session_mut().push_point(point)?;
                report.points.push(point);
            }
            if best.map_or(true, |(b, _)| m.score < b.score) {
                best = Some((m, position));
            }
        }

        if let Some((m, position)) = best {
            let open = self
                .planar
                .session()
                .open_event()
                .map(|e| e.event.event_id);
            if let Some(id) = open {
                if self.planar.session_mut().attach_stereo(id, m, position)? {
                    log::info!(
                        "event {} depth attached at frame {} (disparity {:.1})",
                        id,
                        left.index,
                        m.disparity
                    );
                    report.event_id = Some(id);
                }
            }
        }
        report.matches = matches;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{candidate, ScriptedDetector};
    use crate::events::EventParams;
    use crate::session::SessionMetadata;

    const FPS: f64 = 30.0;

    fn planar(detector: ScriptedDetector, mode: DetectionMode) -> PlanarDetector {
        let meta = SessionMetadata {
            mode,
            calibration_loaded: mode.requires_calibration(),
            ..SessionMetadata::default()
        };
        PlanarDetector::new(
            Box::new(detector),
            EventStateMachine::new(EventParams::default(), FPS).unwrap(),
            SessionAggregator::new(meta, FPS).unwrap(),
            Roi::new(0, 0, 160, 120).unwrap(),
        )
        .unwrap()
    }

    fn frame(index: u64) -> Frame {
        Frame::filled(160, 120, [0, 0, 0], index, index as f64 / FPS)
    }

    fn calibration() -> Arc<Calibration> {
        Arc::new(Calibration::ideal(160, 120, 800.0, 60.0).unwrap())
    }

    #[test]
    fn planar_entry_at_frame_eight_and_exit() {
        let script = ScriptedDetector::new().span(1..=10, candidate(40.0, 60.0, 20.0));
        let mut det = planar(script, DetectionMode::TwoD).with_marked_frames(10);
        let mut transitions = Vec::new();
        for idx in 1..=60 {
            let report = det.process_frame(&frame(idx)).unwrap();
            if let Some(t) = report.transition {
                transitions.push((t, report.event_id));
            }
        }
        assert_eq!(transitions.len(), 2);
        assert!(matches!(transitions[0].0, Transition::Entry { frame_idx: 8, .. }));
        assert!(matches!(transitions[1].0, Transition::Exit { frame_idx: 24, .. }));
        let event = &det.session().events()[0].event;
        assert_eq!(event.bat_center, Some((40.0, 60.0)));
        assert_eq!(event.roi, Some(Roi::new(0, 0, 160, 120).unwrap()));
        let marked = det.marked_frames().unwrap();
        assert_eq!(marked.len(), 2);
        assert_eq!(marked.latest().unwrap().kind, MarkKind::Exit);
    }

    #[test]
    fn roi_outside_frame_is_an_error() {
        let mut det = planar(ScriptedDetector::new(), DetectionMode::TwoD);
        let small = Frame::filled(100, 100, [0, 0, 0], 1, 0.0);
        assert!(det.process_frame(&small).is_err());
    }

    #[test]
    fn stereo_modes_require_calibration() {
        for mode in [DetectionMode::ThreeD, DetectionMode::Hybrid] {
            let result = StereoDetector::new(
                planar(ScriptedDetector::new(), mode),
                Box::new(ScriptedDetector::new()),
                StereoMatcher::default(),
                None,
                mode,
            );
            assert!(result.is_err());
        }
    }

    #[test]
    fn three_d_mode_records_instant_events() {
        let left = ScriptedDetector::new().at(5, candidate(100.0, 60.0, 20.0));
        let right = ScriptedDetector::new().at(5, candidate(90.0, 61.0, 20.0));
        let mut det = StereoDetector::new(
            planar(left, DetectionMode::ThreeD),
            Box::new(right),
            StereoMatcher::default(),
            Some(calibration()),
            DetectionMode::ThreeD,
        )
        .unwrap();
        for idx in 1..=10 {
            det.process_pair(&frame(idx), &frame(idx)).unwrap();
        }
        let events = det.session().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.duration, Some(0.0));
        assert_eq!(events[0].disparity, Some(10.0));
        let p = events[0].position_3d.unwrap();
        assert!((p.z - 800.0 * 60.0 / 10.0).abs() < 1e-6);
        assert_eq!(det.session().trajectory().len(), 1);
    }

    #[test]
    fn hybrid_attaches_first_depth_to_open_event() {
        let left = ScriptedDetector::new().span(1..=12, candidate(100.0, 60.0, 20.0));
        let right = ScriptedDetector::new()
            .span(9..=12, candidate(92.0, 60.0, 20.0))
            .at(3, candidate(80.0, 60.0, 20.0));
        let mut det = StereoDetector::new(
            planar(left, DetectionMode::Hybrid),
            Box::new(right),
            StereoMatcher::default(),
            Some(calibration()),
            DetectionMode::Hybrid,
        )
        .unwrap();
        for idx in 1..=40 {
            det.process_pair(&frame(idx), &frame(idx)).unwrap();
        }
        let events = det.session().events();
        assert_eq!(events.len(), 1);
        // The match on frame 3 precedes the entry and only feeds the trajectory.
        assert_eq!(events[0].disparity, Some(8.0));
        assert_eq!(det.session().trajectory().len(), 5);
        assert_eq!(det.session().trajectory().points()[0].frame_idx, 3);
    }

    #[test]
    fn mismatched_pair_indices_are_rejected() {
        let mut det = StereoDetector::new(
            planar(ScriptedDetector::new(), DetectionMode::TwoD),
            Box::new(ScriptedDetector::new()),
            StereoMatcher::default(),
            None,
            DetectionMode::TwoD,
        )
        .unwrap();
        assert!(det.process_pair(&frame(1), &frame(2)).is_err());
    }
}
