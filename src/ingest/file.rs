//! Local file frame source.
//!
//! `FileSource` dispatches to a backend chosen from the path:
//! - `stub://...` renders a synthetic scene (always available)
//! - anything else is decoded with FFmpeg (feature: ingest-file-ffmpeg)
//!
//! The file source MUST NOT:
//! - Fetch remote URLs
//! - Store decoded frames to disk

use anyhow::{anyhow, Result};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::synthetic::{SyntheticScene, SyntheticSource};
use super::{FrameSource, VideoProperties};
use crate::frame::Frame;

/// Configuration for a local file source.
#[derive(Clone, Debug, Default)]
pub struct FileConfig {
    /// Local file path (e.g., "/data/roost/2024-06-01.mp4") or `stub://` scene.
    pub path: String,
}

impl FileConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
    path: String,
    frames_read: u64,
}

enum FileBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn open(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes): '{}'",
                config.path
            ));
        }
        let backend = if config.path.starts_with("stub://") {
            let (scene, view) = SyntheticScene::from_url(&config.path)?;
            FileBackend::Synthetic(SyntheticSource::new(scene, view))
        } else {
            open_decoded(&config.path)?
        };
        let source = Self {
            backend,
            path: config.path,
            frames_read: 0,
        };
        let props = source.properties();
        log::info!(
            "FileSource: opened {} ({}x{} @ {:.2} fps, {} frames)",
            source.path,
            props.width,
            props.height,
            props.fps,
            props.frame_count
        );
        Ok(source)
    }

    pub fn stats(&self) -> FileStats {
        FileStats {
            frames_read: self.frames_read,
            path: self.path.clone(),
        }
    }
}

impl FrameSource for FileSource {
    fn properties(&self) -> &VideoProperties {
        match &self.backend {
            FileBackend::Synthetic(source) => source.properties(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.properties(),
        }
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let frame = match &mut self.backend {
            FileBackend::Synthetic(source) => source.read()?,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.read()?,
        };
        if frame.is_some() {
            self.frames_read += 1;
        }
        Ok(frame)
    }
}

/// Statistics for a file source.
#[derive(Clone, Debug)]
pub struct FileStats {
    pub frames_read: u64,
    pub path: String,
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_decoded(path: &str) -> Result<FileBackend> {
    Ok(FileBackend::Ffmpeg(FfmpegFileSource::open(path)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_decoded(path: &str) -> Result<FileBackend> {
    Err(anyhow!(
        "decoding '{}' requires the ingest-file-ffmpeg feature",
        path
    ))
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_remote_and_empty_paths() {
        assert!(FileSource::open(FileConfig::new("rtsp://camera/stream")).is_err());
        assert!(FileSource::open(FileConfig::new("  ")).is_err());
    }

    #[test]
    fn stub_path_opens_synthetic_scene() {
        let mut source = FileSource::open(FileConfig::new("stub://roost?frames=3")).unwrap();
        assert_eq!(source.properties().frame_count, 3);
        while source.read().unwrap().is_some() {}
        let stats = source.stats();
        assert_eq!(stats.frames_read, 3);
        assert_eq!(stats.path, "stub://roost?frames=3");
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    #[test]
    fn real_files_need_ffmpeg_feature() {
        let err = FileSource::open(FileConfig::new("/tmp/roost.mp4"))
            .err()
            .expect("decoding must be unavailable");
        assert!(err.to_string().contains("ingest-file-ffmpeg"));
    }
}
