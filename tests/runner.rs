use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use bat_tracker::detect::{candidate, ScriptedDetector};
use bat_tracker::events::{EventParams, EventStateMachine};
use bat_tracker::ingest::{FrameSource, SyntheticScene, View};
use bat_tracker::runner::{self, run_blocking, DetectionJob, Progress, RunOptions};
use bat_tracker::session::{SessionAggregator, SessionMetadata};
use bat_tracker::{PlanarDetector, Roi};

const FPS: f64 = 30.0;

fn detector(script: ScriptedDetector) -> PlanarDetector {
    PlanarDetector::new(
        Box::new(script),
        EventStateMachine::new(EventParams::default(), FPS).unwrap(),
        SessionAggregator::new(SessionMetadata::default(), FPS).unwrap(),
        Roi::full(160, 120),
    )
    .unwrap()
}

fn job(source: impl FrameSource + 'static, script: ScriptedDetector) -> DetectionJob {
    DetectionJob::Planar {
        source: Box::new(source),
        detector: detector(script),
    }
}

fn blank(frames: u64) -> SyntheticScene {
    SyntheticScene::new(160, 120, FPS, frames)
}

#[test]
fn stop_flag_ends_run_before_first_frame() {
    let stop = AtomicBool::new(true);
    let outcome = run_blocking(
        job(blank(50).source(View::Left), ScriptedDetector::new()),
        &RunOptions::default(),
        &stop,
        None,
    )
    .unwrap();
    assert!(outcome.stopped);
    assert!(outcome.is_success());
    assert_eq!(outcome.summary.frames_processed, 0);
}

#[test]
fn decoder_failure_keeps_partial_results() {
    let script = ScriptedDetector::new().span(1..=20, candidate(60.0, 60.0, 25.0));
    let source = blank(100).source(View::Left).failing_after(30);
    let stop = AtomicBool::new(false);
    let outcome = run_blocking(job(source, script), &RunOptions::default(), &stop, None).unwrap();

    let failure = outcome.failure.as_ref().expect("failure payload");
    assert!(!failure.success);
    assert!(failure.message.contains("synthetic decoder failure"));
    assert_eq!(outcome.summary.frames_processed, 30);
    // Entry at 8, exit at 28: both survive the failure on frame 31.
    assert_eq!(outcome.session.closed_events().count(), 1);
    assert!(!outcome.summary.notes.is_empty());
}

#[test]
fn progress_is_throttled_and_reaches_total() {
    let (tx, rx) = mpsc::channel::<Progress>();
    let options = RunOptions {
        progress_every: 10,
        ..RunOptions::default()
    };
    let stop = AtomicBool::new(false);
    run_blocking(
        job(blank(100).source(View::Left), ScriptedDetector::new()),
        &options,
        &stop,
        Some(&tx),
    )
    .unwrap();
    drop(tx);
    let updates: Vec<Progress> = rx.iter().collect();
    assert_eq!(updates.len(), 10);
    assert_eq!(updates.last(), Some(&Progress { current: 100, total: 100 }));
    assert!(updates.windows(2).all(|w| w[0].current < w[1].current));
}

#[test]
fn final_frame_is_reported_when_count_is_not_a_multiple() {
    let (tx, rx) = mpsc::channel::<Progress>();
    let options = RunOptions {
        progress_every: 10,
        ..RunOptions::default()
    };
    let stop = AtomicBool::new(false);
    run_blocking(
        job(blank(95).source(View::Left), ScriptedDetector::new()),
        &options,
        &stop,
        Some(&tx),
    )
    .unwrap();
    drop(tx);
    let updates: Vec<Progress> = rx.iter().collect();
    assert_eq!(updates.len(), 10);
    assert_eq!(updates[8], Progress { current: 90, total: 95 });
    assert_eq!(updates.last(), Some(&Progress { current: 95, total: 95 }));
}

#[test]
fn spawned_run_calls_completion_once_and_resets_running_flag() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let script = ScriptedDetector::new().span(5..=30, candidate(60.0, 60.0, 25.0));
    let handle = runner::spawn(
        job(blank(80).source(View::Left), script),
        RunOptions::default(),
        move |outcome| {
            assert!(outcome.is_success());
            seen.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();
    let progress: Vec<Progress> = handle.progress().iter().collect();
    assert_eq!(progress.len(), 80);
    assert!(!handle.is_running());
    let outcome = handle.join().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.session.events().len(), 1);
    assert_eq!(outcome.summary.detection_count, 26);
}

#[test]
fn stop_request_on_spawned_run() {
    let handle = runner::spawn(
        job(blank(100_000).source(View::Left), ScriptedDetector::new()),
        RunOptions::default(),
        |_| {},
    )
    .unwrap();
    // Wait for the first frame so the stop lands mid-run.
    let first = handle.progress().recv().unwrap();
    assert_eq!(first.current, 1);
    handle.stop();
    let outcome = handle.join().unwrap();
    assert!(outcome.stopped);
    assert!(outcome.summary.frames_processed < 100_000);
}

#[test]
fn preconditions_are_refused_before_the_worker_starts() {
    let reversed = RunOptions {
        start_time: Some(3.0),
        end_time: Some(1.0),
        ..RunOptions::default()
    };
    let result = runner::spawn(
        job(blank(10).source(View::Left), ScriptedDetector::new()),
        reversed,
        |_| panic!("worker must not start"),
    );
    assert!(result.is_err());

    let narrow = PlanarDetector::new(
        Box::new(ScriptedDetector::new()),
        EventStateMachine::new(EventParams::default(), FPS).unwrap(),
        SessionAggregator::new(SessionMetadata::default(), FPS).unwrap(),
        Roi::new(100, 100, 100, 100).unwrap(),
    )
    .unwrap();
    let job = DetectionJob::Planar {
        source: Box::new(blank(10).source(View::Left)),
        detector: narrow,
    };
    let stop = AtomicBool::new(false);
    assert!(run_blocking(job, &RunOptions::default(), &stop, None).is_err());
}
