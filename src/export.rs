//! Session export: JSON document, CSV table, PLY point cloud.
//!
//! Every writer reads the aggregator without mutating it. Events lacking a 3D
//! position export `null` (JSON), empty cells (CSV), or are skipped (PLY).

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use crate::session::{SessionAggregator, StereoEvent};
use crate::DetectionMode;

pub const CSV_HEADER: &str =
    "Event_ID,Entry_Time,Exit_Time,Duration,Frame_Idx,X_2D,Y_2D,X_3D,Y_3D,Z_3D,Depth_Confidence,Disparity";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Ply,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Ply => "ply",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "ply" | "ply-point-cloud" => Ok(ExportFormat::Ply),
            other => Err(anyhow!("unknown export format '{}' (json|csv|ply)", other)),
        }
    }
}

// ---- JSON document ----

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub mode: DetectionMode,
    pub left_video: Option<String>,
    pub right_video: Option<String>,
    pub calibration_loaded: bool,
    pub export_timestamp: String,
    pub total_events: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportEvent {
    pub event_id: usize,
    pub entry_time: f64,
    pub exit_time: Option<f64>,
    pub duration: Option<f64>,
    pub frame_idx: u64,
    pub detection_2d: Option<Point2>,
    pub detection_3d: Option<Detection3>,
    pub depth_confidence: Option<f64>,
    pub stereo_disparity: Option<f64>,
}

impl From<&StereoEvent> for ExportEvent {
    fn from(e: &StereoEvent) -> Self {
        Self {
            event_id: e.event.event_id,
            entry_time: e.event.entry_time,
            exit_time: e.event.exit_time,
            duration: e.event.duration,
            frame_idx: e.event.frame_idx,
            detection_2d: e.event.bat_center.map(|(x, y)| Point2 { x, y }),
            detection_3d: e.position_3d.map(|p| Detection3 {
                x: p.x,
                y: p.y,
                z: p.z,
                confidence: p.confidence,
            }),
            depth_confidence: e.depth_confidence,
            stereo_disparity: e.disparity,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub metadata: ExportMetadata,
    pub events: Vec<ExportEvent>,
}

impl ExportDocument {
    pub fn from_session(session: &SessionAggregator) -> Self {
        let meta = session.metadata();
        let events: Vec<ExportEvent> = session.events().iter().map(ExportEvent::from).collect();
        Self {
            metadata: ExportMetadata {
                mode: meta.mode,
                left_video: meta.left_video.clone(),
                right_video: meta.right_video.clone(),
                calibration_loaded: meta.calibration_loaded,
                export_timestamp: chrono::Utc::now().to_rfc3339(),
                total_events: events.len(),
            },
            events,
        }
    }
}

// ---- Renderers ----

pub fn to_json(session: &SessionAggregator) -> Result<String> {
    Ok(serde_json::to_string_pretty(&ExportDocument::from_session(
        session,
    ))?)
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn to_csv(session: &SessionAggregator) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for e in session.events() {
        let row = ExportEvent::from(e);
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            row.event_id,
            row.entry_time,
            cell(row.exit_time),
            cell(row.duration),
            row.frame_idx,
            cell(row.detection_2d.map(|p| p.x)),
            cell(row.detection_2d.map(|p| p.y)),
            cell(row.detection_3d.map(|p| p.x)),
            cell(row.detection_3d.map(|p| p.y)),
            cell(row.detection_3d.map(|p| p.z)),
            cell(row.depth_confidence),
            cell(row.stereo_disparity),
        );
    }
    out
}

pub fn to_ply(session: &SessionAggregator) -> String {
    let points: Vec<_> = session
        .events()
        .iter()
        .filter_map(|e| e.position_3d)
        .collect();
    let mut out = String::new();
    out.push_str("ply\n");
    out.push_str("format ascii 1.0\n");
    let _ = writeln!(out, "element vertex {}", points.len());
    out.push_str("property float x\n");
    out.push_str("property float y\n");
    out.push_str("property float z\n");
    out.push_str("end_header\n");
    for p in points {
        let _ = writeln!(out, "{} {} {}", p.x as f32, p.y as f32, p.z as f32);
    }
    out
}

pub fn render(session: &SessionAggregator, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => to_json(session),
        ExportFormat::Csv => Ok(to_csv(session)),
        ExportFormat::Ply => Ok(to_ply(session)),
    }
}

pub fn write(session: &SessionAggregator, format: ExportFormat, path: &Path) -> Result<()> {
    let body = render(session, format)?;
    std::fs::write(path, body)
        .with_context(|| format!("failed to write {} export to {}", format.extension(), path.display()))?;
    log::info!(
        "exported {} events as {} to {}",
        session.events().len(),
        format.extension(),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::candidate;
    use crate::events::Transition;
    use crate::session::SessionMetadata;
    use crate::stereo::{Position3, StereoMatch};

    fn hybrid_session() -> SessionAggregator {
        let meta = SessionMetadata {
            mode: DetectionMode::Hybrid,
            left_video: Some("left.mp4".into()),
            right_video: Some("right.mp4".into()),
            calibration_loaded: true,
        };
        let mut s = SessionAggregator::new(meta, 30.0).unwrap();
        let id = s
            .apply(&Transition::Entry {
                frame_idx: 30,
                time: 1.0,
                bat_center: Some((100.0, 50.0)),
                zone: None,
            })
            .unwrap();
        let m = StereoMatch {
            left: candidate(100.0, 50.0, 20.0),
            right: candidate(90.0, 52.0, 21.0),
            disparity: 10.0,
            score: 0.25,
            depth_confidence: 0.8,
        };
        let pos = Position3 {
            x: 1.5,
            y: -2.0,
            z: 840.0,
            confidence: 1.0,
        };
        s.attach_stereo(id, &m, Some(pos)).unwrap();
        s.close_open_event(45).unwrap();
        // Second event stays 2D-only and open.
        s.apply(&Transition::Entry {
            frame_idx: 90,
            time: 3.0,
            bat_center: Some((10.0, 20.0)),
            zone: None,
        })
        .unwrap();
        s
    }

    #[test]
    fn format_parsing() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("ply-point-cloud".parse::<ExportFormat>().unwrap(), ExportFormat::Ply);
        assert!("pdf".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn json_document_shape() {
        let s = hybrid_session();
        let json = to_json(&s).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["metadata"]["mode"], "hybrid");
        assert_eq!(value["metadata"]["total_events"], 2);
        assert_eq!(value["metadata"]["calibration_loaded"], true);
        assert!(chrono::DateTime::parse_from_rfc3339(
            value["metadata"]["export_timestamp"].as_str().unwrap()
        )
        .is_ok());
        assert_eq!(value["events"][0]["detection_2d"]["x"], 100.0);
        assert_eq!(value["events"][0]["detection_3d"]["z"], 840.0);
        assert_eq!(value["events"][0]["stereo_disparity"], 10.0);
        assert!(value["events"][1]["detection_3d"].is_null());
        assert!(value["events"][1]["exit_time"].is_null());

        let doc: ExportDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(doc.events.len(), 2);
    }

    #[test]
    fn csv_leaves_missing_cells_empty() {
        let csv = to_csv(&hybrid_session());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "0,1,1.5,0.5,30,100,50,1.5,-2,840,0.8,10");
        assert_eq!(lines[2], "1,3,,,90,10,20,,,,,");
    }

    #[test]
    fn ply_lists_only_events_with_positions() {
        let ply = to_ply(&hybrid_session());
        let lines: Vec<&str> = ply.lines().collect();
        assert_eq!(lines[2], "element vertex 1");
        assert_eq!(lines[6], "end_header");
        assert_eq!(lines[7], "1.5 -2 840");
        assert_eq!(lines.len(), 8);
    }

    #[test]
    fn empty_session_still_writes_valid_files() {
        let s = SessionAggregator::new(SessionMetadata::default(), 25.0).unwrap();
        assert!(to_ply(&s).contains("element vertex 0\n"));
        assert_eq!(to_csv(&s).lines().count(), 1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        s.export(ExportFormat::Json, &path).unwrap();
        let doc: ExportDocument =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc.metadata.total_events, 0);
        assert_eq!(doc.metadata.mode, DetectionMode::TwoD);
    }

    #[test]
    fn export_does_not_mutate_session() {
        let s = hybrid_session();
        let before = s.snapshot_events();
        let dir = tempfile::tempdir().unwrap();
        for format in [ExportFormat::Json, ExportFormat::Csv, ExportFormat::Ply] {
            s.export(format, &dir.path().join(format!("out.{}", format.extension())))
                .unwrap();
        }
        assert_eq!(s.snapshot_events(), before);
        assert!(s.open_event().is_some());
    }
}
