//! Detection runs on a worker thread.
//!
//! A run owns its sources and detector. It polls a stop flag once per frame,
//! sends `(current, total)` progress over a channel that never blocks the
//! worker, and ends with one `RunOutcome`. A failure mid-run keeps every
//! event recorded so far and attaches a `RunFailure` payload.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::config::{RunSettings, TrackerConfig};
use crate::detect::MotionSegmenter;
use crate::events::EventStateMachine;
use crate::frame::{MarkedFrameBuffer, Roi};
use crate::ingest::{validate_properties, FrameSource, StereoSource, VideoProperties};
use crate::pipeline::{FrameReport, PlanarDetector, StereoDetector};
use crate::session::{SessionAggregator, SessionMetadata};
use crate::stereo::{Calibration, StereoMatcher};
use crate::zone::ZoneSet;

// ----------------------------------------------------------------------------
// Jobs
// ----------------------------------------------------------------------------

pub enum DetectionJob {
    Planar {
        source: Box<dyn FrameSource>,
        detector: PlanarDetector,
    },
    Stereo {
        source: StereoSource,
        detector: StereoDetector,
    },
}

/// Per-run choices that do not come from the configuration.
#[derive(Clone, Debug, Default)]
pub struct JobSetup {
    /// Defaults to the full frame.
    pub roi: Option<Roi>,
    pub zones: ZoneSet,
    pub mark_frames: bool,
    pub metadata: SessionMetadata,
}

enum Step {
    End,
    Skipped,
    Processed(FrameReport),
}

impl DetectionJob {
    /// Single-stream job using the mixture-model segmenter.
    pub fn planar(source: Box<dyn FrameSource>, cfg: &TrackerConfig, setup: JobSetup) -> Result<Self> {
        let props = validate_properties(source.properties(), &cfg.video)?;
        let segmenter = MotionSegmenter::new(cfg.segmenter.clone())?;
        let detector = build_planar(&segmenter, &props, cfg, setup)?;
        Ok(DetectionJob::Planar { source, detector })
    }

    /// Stereo job; the detection mode comes from `setup.metadata.mode`.
    pub fn stereo(
        source: StereoSource,
        cfg: &TrackerConfig,
        mut setup: JobSetup,
        calibration: Option<Arc<Calibration>>,
    ) -> Result<Self> {
        let props = validate_properties(source.properties(), &cfg.video)?;
        let mode = setup.metadata.mode;
        setup.metadata.calibration_loaded = calibration.is_some();
        let segmenter = MotionSegmenter::new(cfg.segmenter.clone())?;
        let planar = build_planar(&segmenter, &props, cfg, setup)?;
        let matcher = StereoMatcher::new(cfg.matcher.clone())?;
        let mut detector = StereoDetector::new(
            planar,
            Box::new(segmenter.session()),
            matcher,
            calibration,
            mode,
        )?;
        if cfg.rectify {
            detector = detector.with_rectification(props.width, props.height)?;
        }
        Ok(DetectionJob::Stereo { source, detector })
    }

    pub fn properties(&self) -> &VideoProperties {
        match self {
            DetectionJob::Planar { source, .. } => source.properties(),
            DetectionJob::Stereo { source, .. } => source.properties(),
        }
    }

    fn planar_detector(&self) -> &PlanarDetector {
        match self {
            DetectionJob::Planar { detector, .. } => detector,
            DetectionJob::Stereo { detector, .. } => detector.planar(),
        }
    }

    pub fn fps(&self) -> f64 {
        self.planar_detector().session().fps()
    }

    fn check(&self) -> Result<()> {
        let props = self.properties();
        let roi = self.planar_detector().roi();
        if !roi.fits(props.width, props.height) {
            return Err(anyhow!(
                "roi {:?} does not fit inside {}x{} video",
                roi,
                props.width,
                props.height
            ));
        }
        Ok(())
    }

    fn step(&mut self, range: &FrameRange) -> Result<Step> {
        match self {
            DetectionJob::Planar { source, detector } => {
                let Some(frame) = source.read()? else {
                    return Ok(Step::End);
                };
                match range.classify(frame.index) {
                    Placement::Before => Ok(Step::Skipped),
                    Placement::After => Ok(Step::End),
                    Placement::Inside => detector.process_frame(&frame).map(Step::Processed),
                }
            }
            DetectionJob::Stereo { source, detector } => {
                let Some((left, right)) = source.read_pair()? else {
                    return Ok(Step::End);
                };
                match range.classify(left.index) {
                    Placement::Before => Ok(Step::Skipped),
                    Placement::After => Ok(Step::End),
                    Placement::Inside => detector.process_pair(&left, &right).map(Step::Processed),
                }
            }
        }
    }

    fn finalize(&mut self, last_frame: u64) -> Result<Option<usize>> {
        match self {
            DetectionJob::Planar { detector, .. } => detector.finalize(last_frame),
            DetectionJob::Stereo { detector, .. } => detector.planar_mut().finalize(last_frame),
        }
    }

    fn into_parts(self) -> (SessionAggregator, Option<MarkedFrameBuffer>) {
        match self {
            DetectionJob::Planar { detector, .. } => detector.into_parts(),
            DetectionJob::Stereo { detector, .. } => detector.into_planar().into_parts(),
        }
    }
}

fn build_planar(
    segmenter: &MotionSegmenter,
    props: &VideoProperties,
    cfg: &TrackerConfig,
    setup: JobSetup,
) -> Result<PlanarDetector> {
    let roi = setup.roi.unwrap_or_else(|| Roi::full(props.width, props.height));
    let machine = EventStateMachine::new(cfg.events.clone(), props.fps)?.with_zones(setup.zones);
    let session = SessionAggregator::new(setup.metadata, props.fps)?;
    let detector = PlanarDetector::new(Box::new(segmenter.session()), machine, session, roi)?;
    Ok(if setup.mark_frames {
        detector.with_marked_frames(cfg.run.marked_frames)
    } else {
        detector
    })
}

// ----------------------------------------------------------------------------
// Options and results
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct RunOptions {
    /// Seconds; earlier frames are read and discarded.
    pub start_time: Option<f64>,
    /// Seconds; the run ends after the last frame at or before this time.
    pub end_time: Option<f64>,
    pub progress_every: u64,
    pub finalize_open_events: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            start_time: None,
            end_time: None,
            progress_every: 1,
            finalize_open_events: false,
        }
    }
}

impl RunOptions {
    pub fn from_settings(settings: &RunSettings) -> Self {
        Self {
            progress_every: settings.progress_interval,
            finalize_open_events: settings.finalize_open_events,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(start) = self.start_time {
            if !(start >= 0.0 && start.is_finite()) {
                return Err(anyhow!("start time must be a non-negative number of seconds"));
            }
        }
        if let Some(end) = self.end_time {
            if !(end > 0.0 && end.is_finite()) {
                return Err(anyhow!("end time must be a positive number of seconds"));
            }
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start >= end {
                return Err(anyhow!("start time {}s is not before end time {}s", start, end));
            }
        }
        if self.progress_every == 0 {
            return Err(anyhow!("progress interval must be at least one frame"));
        }
        Ok(())
    }
}

enum Placement {
    Before,
    Inside,
    After,
}

/// Requested time range as 1-based frame indices at the run's fps.
struct FrameRange {
    first: u64,
    last: u64,
    total: u64,
}

impl FrameRange {
    fn new(options: &RunOptions, props: &VideoProperties, fps: f64) -> Self {
        let start = options.start_time.unwrap_or(0.0);
        let end = options.end_time.unwrap_or(f64::INFINITY);
        let first = ((start * fps).ceil() as u64).max(1);
        let last = if end.is_finite() {
            (end * fps).floor() as u64
        } else {
            u64::MAX
        };
        let counted = last.min(props.frame_count);
        let total = if counted >= first { counted - first + 1 } else { 0 };
        Self { first, last, total }
    }

    fn classify(&self, index: u64) -> Placement {
        if index < self.first {
            Placement::Before
        } else if index > self.last {
            Placement::After
        } else {
            Placement::Inside
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FramePosition {
    pub frame_idx: u64,
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AnalysisSummary {
    pub frames_processed: u64,
    pub fps: f64,
    pub duration_secs: f64,
    /// Frames with at least one qualifying candidate.
    pub detection_count: u64,
    pub first_position: Option<FramePosition>,
    pub last_position: Option<FramePosition>,
    /// Primary candidate per frame with motion.
    pub positions: Vec<FramePosition>,
    pub events: usize,
    pub trajectory_points: usize,
    pub elapsed_secs: f64,
    pub notes: Vec<String>,
}

impl AnalysisSummary {
    fn record(&mut self, report: &FrameReport) {
        self.frames_processed += 1;
        if report.has_motion() {
            self.detection_count += 1;
        }
        if let Some(p) = report.primary {
            let pos = FramePosition {
                frame_idx: report.frame_idx,
                x: p.cx,
                y: p.cy,
            };
            if self.first_position.is_none() {
                self.first_position = Some(pos);
            }
            self.last_position = Some(pos);
            self.positions.push(pos);
        }
    }
}

/// Failure payload handed to callers outside the crate.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunFailure {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl RunFailure {
    pub fn from_error(err: &anyhow::Error) -> Self {
        let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        Self {
            success: false,
            message: err.to_string(),
            details: if causes.is_empty() {
                None
            } else {
                Some(causes.join(": "))
            },
        }
    }
}

pub struct RunOutcome {
    pub session: SessionAggregator,
    pub marked_frames: Option<MarkedFrameBuffer>,
    pub summary: AnalysisSummary,
    pub failure: Option<RunFailure>,
    pub stopped: bool,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

// ----------------------------------------------------------------------------
// Running
// ----------------------------------------------------------------------------

/// Run to completion on the calling thread.
///
/// Returns `Err` only for precondition failures. Errors while reading or
/// processing frames end the run and are reported in `RunOutcome::failure`.
pub fn run_blocking(
    mut job: DetectionJob,
    options: &RunOptions,
    stop: &AtomicBool,
    progress: Option<&Sender<Progress>>,
) -> Result<RunOutcome> {
    options.validate()?;
    job.check()?;

    let fps = job.fps();
    let range = FrameRange::new(options, job.properties(), fps);
    let started = Instant::now();
    let mut summary = AnalysisSummary {
        fps,
        ..AnalysisSummary::default()
    };
    let mut last_frame = 0u64;
    let mut stopped = false;
    let mut skipped = 0u64;
    let mut reported = 0u64;
    log::info!(
        "detection run started: {} frames at {:.2} fps",
        range.total,
        fps
    );

    let failure = loop {
        if stop.load(Ordering::SeqCst) {
            stopped = true;
            summary
                .notes
                .push(format!("stopped on request after {} frames", summary.frames_processed));
            log::info!("detection run stopped on request");
            break None;
        }
        match job.step(&range) {
            Ok(Step::End) => break None,
            Ok(Step::Skipped) => skipped += 1,
            Ok(Step::Processed(report)) => {
                last_frame = report.frame_idx;
                summary.record(&report);
                if let Some(tx) = progress {
                    if summary.frames_processed % options.progress_every == 0 {
                        reported = summary.frames_processed;
                        let _ = tx.send(Progress {
                            current: reported,
                            total: range.total,
                        });
                    }
                }
            }
            Err(err) => {
                log::error!("detection run failed at frame {}: {:#}", last_frame + 1, err);
                summary.notes.push(format!(
                    "run ended early after {} frames",
                    summary.frames_processed
                ));
                break Some(RunFailure::from_error(&err));
            }
        }
    };

    if let Some(tx) = progress {
        if reported < summary.frames_processed {
            let _ = tx.send(Progress {
                current: summary.frames_processed,
                total: range.total,
            });
        }
    }
    if skipped > 0 {
        log::debug!("{} frames before the start time were discarded", skipped);
    }
    if options.finalize_open_events && last_frame > 0 {
        match job.finalize(last_frame) {
            Ok(Some(id)) => summary
                .notes
                .push(format!("event {} closed at end of run", id)),
            Ok(None) => {}
            Err(err) => log::warn!("could not close open event: {:#}", err),
        }
    }

    let (session, marked_frames) = job.into_parts();
    summary.duration_secs = summary.frames_processed as f64 / fps;
    summary.events = session.events().len();
    summary.trajectory_points = session.trajectory().len();
    summary.elapsed_secs = started.elapsed().as_secs_f64();
    if summary.frames_processed == 0 && failure.is_none() && !stopped {
        summary.notes.push("no frames in the requested range".to_string());
    }
    log::info!(
        "detection run finished: {} frames, {} events, {} trajectory points in {:.1}s",
        summary.frames_processed,
        summary.events,
        summary.trajectory_points,
        summary.elapsed_secs
    );

    Ok(RunOutcome {
        session,
        marked_frames,
        summary,
        failure,
        stopped,
    })
}

/// Handle to a detection run on a worker thread.
pub struct RunHandle {
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    progress: Receiver<Progress>,
    join: Option<JoinHandle<Result<RunOutcome>>>,
}

impl RunHandle {
    /// Ask the worker to stop after the current frame.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Flag shared with signal handlers.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> &Receiver<Progress> {
        &self.progress
    }

    pub fn join(mut self) -> Result<RunOutcome> {
        let join = self
            .join
            .take()
            .ok_or_else(|| anyhow!("detection run already joined"))?;
        join.join()
            .map_err(|_| anyhow!("detection worker thread panicked"))?
    }
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Start a run on a worker thread. `on_complete` is called exactly once with
/// the outcome before the handle's `join` returns it.
pub fn spawn<F>(job: DetectionJob, options: RunOptions, on_complete: F) -> Result<RunHandle>
where
    F: FnOnce(&RunOutcome) + Send + 'static,
{
    options.validate()?;
    job.check()?;

    let stop = Arc::new(AtomicBool::new(false));
    let running = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel();
    let stop_thread = stop.clone();
    let guard = RunningGuard(running.clone());
    let join = std::thread::Builder::new()
        .name("bat-detect".to_string())
        .spawn(move || {
            let _guard = guard;
            let outcome = run_blocking(job, &options, &stop_thread, Some(&tx))?;
            on_complete(&outcome);
            Ok(outcome)
        })?;

    Ok(RunHandle {
        stop,
        running,
        progress: rx,
        join: Some(join),
    })
}
