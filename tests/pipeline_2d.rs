use std::sync::atomic::AtomicBool;

use bat_tracker::config::TrackerConfig;
use bat_tracker::export::ExportDocument;
use bat_tracker::detect::{candidate, ScriptedDetector};
use bat_tracker::events::{EventParams, EventStateMachine, Transition};
use bat_tracker::ingest::{FrameSource, SyntheticScene, View};
use bat_tracker::runner::{run_blocking, DetectionJob, JobSetup, RunOptions};
use bat_tracker::session::{SessionAggregator, SessionMetadata};
use bat_tracker::{ExportFormat, PlanarDetector, PolygonZone, Roi, ZoneSet};

fn colony() -> SyntheticScene {
    SyntheticScene::colony(160, 120, 30.0, 200)
}

#[test]
fn synthetic_colony_yields_one_event_per_flight() {
    let scene = colony();
    assert_eq!(scene.flights.len(), 2);
    let source = scene.source(View::Left);
    let job = DetectionJob::planar(Box::new(source), &TrackerConfig::default(), JobSetup::default())
        .expect("planar job");
    let stop = AtomicBool::new(false);
    let outcome = run_blocking(job, &RunOptions::default(), &stop, None).expect("run");

    assert!(outcome.is_success());
    assert_eq!(outcome.summary.frames_processed, 200);
    let events = outcome.session.events();
    assert_eq!(events.len(), scene.flights.len());
    for (event, flight) in events.iter().zip(&scene.flights) {
        let entry = event.event.frame_idx;
        assert!(
            entry > flight.first_frame && entry <= flight.first_frame + 12,
            "entry at {} for flight starting at {}",
            entry,
            flight.first_frame
        );
        let exit = event.event.exit_frame.expect("closed event");
        assert!(exit > flight.last_frame);
        let (x, y) = event.event.bat_center.expect("centre");
        let (fx, fy) = flight.position(entry).expect("airborne at entry");
        assert!((x - fx).abs() < 1.0 && (y - fy).abs() < 1.0);
    }
    assert!(outcome.summary.detection_count >= 70);
    assert!(outcome.summary.first_position.is_some());
}

fn scripted_detector(script: ScriptedDetector, zones: ZoneSet) -> PlanarDetector {
    let machine = EventStateMachine::new(EventParams::default(), 30.0)
        .unwrap()
        .with_zones(zones);
    let session = SessionAggregator::new(SessionMetadata::default(), 30.0).unwrap();
    PlanarDetector::new(Box::new(script), machine, session, Roi::full(160, 120)).unwrap()
}

#[test]
fn sustained_motion_opens_event_at_eighth_frame() {
    let script = ScriptedDetector::new().span(1..=10, candidate(50.0, 40.0, 30.0));
    let mut detector = scripted_detector(script, ZoneSet::default());
    let mut source = SyntheticScene::new(160, 120, 30.0, 40).source(View::Left);
    let mut entries = Vec::new();
    while let Some(frame) = source.read().unwrap() {
        let report = detector.process_frame(&frame).unwrap();
        if let Some(Transition::Entry { frame_idx, time, .. }) = report.transition {
            entries.push((frame_idx, time));
        }
    }
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, 8);
    assert!((entries[0].1 - 8.0 / 30.0).abs() < 1e-9);
    let event = &detector.session().events()[0].event;
    assert_eq!(event.bat_center, Some((50.0, 40.0)));
}

#[test]
fn zones_gate_entries_by_bat_centre() {
    let zone = PolygonZone::parse("0,0;80,0;80,120;0,120").unwrap();
    // Sustained motion outside the zone, then the bat crosses into it.
    let script = ScriptedDetector::new()
        .span(1..=59, candidate(120.0, 40.0, 30.0))
        .span(60..=80, candidate(20.0, 40.0, 30.0));
    let mut detector = scripted_detector(script, ZoneSet::new(vec![zone]));
    let mut source = SyntheticScene::new(160, 120, 30.0, 120).source(View::Left);
    while let Some(frame) = source.read().unwrap() {
        detector.process_frame(&frame).unwrap();
    }
    let events = detector.session().events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.frame_idx, 60);
    assert_eq!(events[0].event.zone, Some(0));
    assert_eq!(events[0].event.bat_center, Some((20.0, 40.0)));
}

#[test]
fn open_event_at_end_of_video_is_kept_open_or_finalized() {
    let script = ScriptedDetector::new().span(1..=40, candidate(50.0, 40.0, 30.0));
    let scene = SyntheticScene::new(160, 120, 30.0, 30);

    let job = DetectionJob::Planar {
        source: Box::new(scene.source(View::Left)),
        detector: scripted_detector(script.clone(), ZoneSet::default()),
    };
    let stop = AtomicBool::new(false);
    let outcome = run_blocking(job, &RunOptions::default(), &stop, None).unwrap();
    assert_eq!(outcome.session.events().len(), 1);
    assert!(outcome.session.events()[0].event.exit_time.is_none());
    assert_eq!(outcome.session.closed_events().count(), 0);

    let job = DetectionJob::Planar {
        source: Box::new(scene.source(View::Left)),
        detector: scripted_detector(script, ZoneSet::default()),
    };
    let options = RunOptions {
        finalize_open_events: true,
        ..RunOptions::default()
    };
    let outcome = run_blocking(job, &options, &stop, None).unwrap();
    let event = &outcome.session.events()[0].event;
    assert_eq!(event.exit_frame, Some(30));
    assert_eq!(outcome.session.closed_events().count(), 1);
}

#[test]
fn time_range_discards_frames_before_start() {
    let script = ScriptedDetector::new().span(1..=90, candidate(50.0, 40.0, 30.0));
    let job = DetectionJob::Planar {
        source: Box::new(SyntheticScene::new(160, 120, 30.0, 90).source(View::Left)),
        detector: scripted_detector(script, ZoneSet::default()),
    };
    let options = RunOptions {
        start_time: Some(1.0),
        end_time: Some(2.0),
        ..RunOptions::default()
    };
    let stop = AtomicBool::new(false);
    let outcome = run_blocking(job, &options, &stop, None).unwrap();
    // Frames 30..=60.
    assert_eq!(outcome.summary.frames_processed, 31);
    assert_eq!(outcome.summary.positions[0].frame_idx, 30);
    assert_eq!(outcome.session.events()[0].event.frame_idx, 37);
}

#[test]
fn marked_frames_and_exports_are_written() {
    let script = ScriptedDetector::new().span(1..=10, candidate(50.0, 40.0, 30.0));
    let detector = scripted_detector(script, ZoneSet::default()).with_marked_frames(8);
    let job = DetectionJob::Planar {
        source: Box::new(SyntheticScene::new(160, 120, 30.0, 40).source(View::Left)),
        detector,
    };
    let stop = AtomicBool::new(false);
    let outcome = run_blocking(job, &RunOptions::default(), &stop, None).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let marked = outcome.marked_frames.expect("marked frames enabled");
    let written = marked.write_jpegs(&dir.path().join("marked")).unwrap();
    assert_eq!(written.len(), 2);
    assert!(written[0].ends_with("event_0000_entry_000008.jpg"));
    assert!(written.iter().all(|p| p.exists()));

    let csv = dir.path().join("events.csv");
    outcome.session.export(ExportFormat::Csv, &csv).unwrap();
    let text = std::fs::read_to_string(&csv).unwrap();
    assert_eq!(text.lines().count(), 2);
    assert!(text.lines().nth(1).unwrap().starts_with("0,"));
}

#[test]
fn json_export_preserves_event_timing_exactly() {
    let script = ScriptedDetector::new()
        .span(1..=10, candidate(50.0, 40.0, 30.0))
        .span(40..=70, candidate(60.0, 45.0, 30.0));
    let job = DetectionJob::Planar {
        source: Box::new(SyntheticScene::new(160, 120, 30.0, 100).source(View::Left)),
        detector: scripted_detector(script, ZoneSet::default()),
    };
    let stop = AtomicBool::new(false);
    let outcome = run_blocking(job, &RunOptions::default(), &stop, None).unwrap();
    assert_eq!(outcome.session.closed_events().count(), 2);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.json");
    outcome.session.export(ExportFormat::Json, &path).unwrap();
    let doc: ExportDocument =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

    let expected: Vec<_> = outcome
        .session
        .events()
        .iter()
        .map(|e| (e.event.entry_time, e.event.exit_time, e.event.duration, e.event.frame_idx))
        .collect();
    let parsed: Vec<_> = doc
        .events
        .iter()
        .map(|e| (e.entry_time, e.exit_time, e.duration, e.frame_idx))
        .collect();
    assert_eq!(parsed, expected);
}

#[test]
fn implausible_fps_drives_both_range_and_event_clock() {
    // 240 fps is outside the accepted range, so the run falls back to 30 fps.
    let scene = SyntheticScene::new(160, 120, 240.0, 300);
    let job = DetectionJob::planar(
        Box::new(scene.source(View::Left)),
        &TrackerConfig::default(),
        JobSetup::default(),
    )
    .unwrap();
    assert_eq!(job.fps(), 30.0);
    let options = RunOptions {
        start_time: Some(1.0),
        end_time: Some(2.0),
        ..RunOptions::default()
    };
    let stop = AtomicBool::new(false);
    let outcome = run_blocking(job, &options, &stop, None).unwrap();
    // Frames 30..=60 at 30 fps.
    assert_eq!(outcome.summary.frames_processed, 31);
    assert_eq!(outcome.summary.fps, 30.0);

    // Reports carry the same clock as the events, not the decoder's stamps.
    let script = ScriptedDetector::new().span(1..=10, candidate(50.0, 40.0, 30.0));
    let mut detector = scripted_detector(script, ZoneSet::default());
    let mut source = scene.source(View::Left);
    let mut entry = None;
    while let Some(frame) = source.read().unwrap() {
        let report = detector.process_frame(&frame).unwrap();
        assert_eq!(report.timestamp, frame.index as f64 / 30.0);
        if let Some(Transition::Entry { time, .. }) = report.transition {
            entry = Some((report.timestamp, time));
        }
        if frame.index == 20 {
            break;
        }
    }
    let (stamp, time) = entry.expect("entry");
    assert_eq!(stamp, time);
}
