//! bat_detect - entry/exit events for one infrared video
//!
//! This tool:
//! 1. Opens a local video (or a `stub://` synthetic scene)
//! 2. Runs motion segmentation and the entry/exit state machine on a worker
//! 3. Exports the events as JSON, CSV or PLY
//! 4. Optionally writes annotated entry/exit frames as JPEG

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use bat_tracker::config::TrackerConfig;
use bat_tracker::runner::{self, DetectionJob, JobSetup, RunOptions};
use bat_tracker::session::SessionMetadata;
use bat_tracker::{DetectionMode, ExportFormat, FileConfig, FileSource, PolygonZone, Roi, ZoneSet};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Video file path, or a stub:// synthetic scene.
    input: String,
    /// Region of interest as x,y,w,h (defaults to the full frame).
    #[arg(long)]
    roi: Option<String>,
    /// Start of the analysed range in seconds.
    #[arg(long)]
    start: Option<f64>,
    /// End of the analysed range in seconds.
    #[arg(long)]
    end: Option<f64>,
    /// Entry zone polygon as "x,y;x,y;x,y..." (repeatable).
    #[arg(long = "zone", value_name = "POLYGON")]
    zones: Vec<String>,
    /// Export file path.
    #[arg(long, default_value = "bat_events.json")]
    out: PathBuf,
    /// Export format (json|csv|ply); inferred from --out when omitted.
    #[arg(long)]
    format: Option<String>,
    /// Directory for annotated entry/exit frames.
    #[arg(long, value_name = "DIR")]
    marked_frames: Option<PathBuf>,
    /// Close an event still open at the end of the video.
    #[arg(long)]
    finalize: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let config = TrackerConfig::load()?;
    let format = export_format(args.format.as_deref(), &args.out)?;
    let roi = args.roi.as_deref().map(Roi::parse).transpose()?;
    let zones = args
        .zones
        .iter()
        .map(|z| PolygonZone::parse(z))
        .collect::<Result<Vec<_>>>()?;

    let source = {
        let _stage = ui.stage("Open video");
        FileSource::open(FileConfig::new(&args.input))?
    };
    let setup = JobSetup {
        roi,
        zones: ZoneSet::new(zones),
        mark_frames: args.marked_frames.is_some(),
        metadata: SessionMetadata {
            mode: DetectionMode::TwoD,
            left_video: Some(args.input.clone()),
            right_video: None,
            calibration_loaded: false,
        },
    };
    let job = DetectionJob::planar(Box::new(source), &config, setup)?;

    let mut options = RunOptions::from_settings(&config.run);
    options.start_time = args.start;
    options.end_time = args.end;
    options.finalize_open_events |= args.finalize;

    let total = job.properties().frame_count;
    let handle = runner::spawn(job, options, |outcome| {
        log::info!(
            "analysis complete: {} events over {} frames",
            outcome.summary.events,
            outcome.summary.frames_processed
        );
    })?;
    let stop = handle.stop_flag();
    ctrlc::set_handler(move || {
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    {
        let mut progress = ui.frames("Detect", total);
        for p in handle.progress().iter() {
            progress.update(p.current, p.total);
        }
    }
    let outcome = handle.join()?;

    {
        let _stage = ui.stage("Export events");
        outcome.session.export(format, &args.out)?;
    }
    if let (Some(dir), Some(marked)) = (&args.marked_frames, &outcome.marked_frames) {
        let _stage = ui.stage("Write marked frames");
        let written = marked.write_jpegs(dir)?;
        log::info!("{} marked frames written to {}", written.len(), dir.display());
    }

    let summary = &outcome.summary;
    println!(
        "{} events ({} closed), {} frames with motion of {} processed, written to {}",
        summary.events,
        outcome.session.closed_events().count(),
        summary.detection_count,
        summary.frames_processed,
        args.out.display()
    );
    for note in &summary.notes {
        println!("note: {}", note);
    }

    if let Some(failure) = outcome.failure {
        eprintln!("{}", serde_json::to_string_pretty(&failure)?);
        return Err(anyhow!("detection failed: {}", failure.message));
    }
    Ok(())
}

fn export_format(flag: Option<&str>, out: &Path) -> Result<ExportFormat> {
    match flag {
        Some(format) => format.parse(),
        None => match out.extension().and_then(|e| e.to_str()) {
            Some(ext) => ext.parse(),
            None => Ok(ExportFormat::Json),
        },
    }
}
