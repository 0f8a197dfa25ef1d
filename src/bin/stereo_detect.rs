//! stereo_detect - bat events and 3D trajectory from a synchronized camera pair
//!
//! This tool:
//! 1. Opens the left and right videos and checks they are in step
//! 2. Loads the stereo calibration (required for 3d and hybrid modes)
//! 3. Runs detection on a worker; Ctrl-C stops after the current frame pair
//! 4. Exports events (JSON, CSV) or the 3D point cloud (PLY)

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bat_tracker::config::TrackerConfig;
use bat_tracker::runner::{self, DetectionJob, JobSetup, RunOptions};
use bat_tracker::session::SessionMetadata;
use bat_tracker::{
    Calibration, DetectionMode, ExportFormat, FileConfig, FileSource, Roi, StereoSource,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Left camera video path (or stub:// scene).
    #[arg(long)]
    left: String,
    /// Right camera video path (or stub:// scene with view=right).
    #[arg(long)]
    right: String,
    /// Stereo calibration JSON.
    #[arg(long)]
    calibration: Option<PathBuf>,
    /// Detection mode (2d|3d|hybrid).
    #[arg(long, default_value = "hybrid")]
    mode: DetectionMode,
    /// Region of interest as x,y,w,h (defaults to the full frame).
    #[arg(long)]
    roi: Option<String>,
    /// Start of the analysed range in seconds.
    #[arg(long)]
    start: Option<f64>,
    /// End of the analysed range in seconds.
    #[arg(long)]
    end: Option<f64>,
    /// Export file path.
    #[arg(long, default_value = "stereo_events.json")]
    out: PathBuf,
    /// Export format (json|csv|ply); inferred from --out when omitted.
    #[arg(long)]
    format: Option<String>,
    /// Close an event still open at the end of the videos.
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

    let calibration = match &args.calibration {
        Some(path) => {
            let _stage = ui.stage("Load calibration");
            let cal = Calibration::from_file(path)?;
            log::info!("calibration loaded, baseline {:.2}", cal.baseline());
            Some(Arc::new(cal))
        }
        None if args.mode.requires_calibration() => {
            return Err(anyhow!("--calibration is required for {} mode", args.mode));
        }
        None => None,
    };

    let source = {
        let _stage = ui.stage("Open stereo videos");
        let left = FileSource::open(FileConfig::new(&args.left))?;
        let right = FileSource::open(FileConfig::new(&args.right))?;
        StereoSource::new(Box::new(left), Box::new(right))?
    };
    let setup = JobSetup {
        roi,
        metadata: SessionMetadata {
            mode: args.mode,
            left_video: Some(args.left.clone()),
            right_video: Some(args.right.clone()),
            calibration_loaded: calibration.is_some(),
        },
        ..JobSetup::default()
    };
    let job = DetectionJob::stereo(source, &config, setup, calibration)?;

    let mut options = RunOptions::from_settings(&config.run);
    options.start_time = args.start;
    options.end_time = args.end;
    options.finalize_open_events |= args.finalize;

    let total = job.properties().frame_count;
    let handle = runner::spawn(job, options, |outcome| {
        log::info!(
            "stereo analysis complete: {} events, {} trajectory points",
            outcome.summary.events,
            outcome.summary.trajectory_points
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
        let _stage = ui.stage("Export session");
        outcome.session.export(format, &args.out)?;
    }

    let session = &outcome.session;
    println!(
        "{} events ({} with depth), {} trajectory points, written to {}",
        session.events().len(),
        session.events().iter().filter(|e| e.position_3d.is_some()).count(),
        session.trajectory().len(),
        args.out.display()
    );
    for note in &outcome.summary.notes {
        println!("note: {}", note);
    }

    if let Some(failure) = outcome.failure {
        eprintln!("{}", serde_json::to_string_pretty(&failure)?);
        return Err(anyhow!("stereo detection failed: {}", failure.message));
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
