use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use crate::detect::{AreaRange, BackgroundParams, LearningMode, SegmenterParams};
use crate::events::{EventParams, StabilizationRule};
use crate::ingest::VideoLimits;
use crate::stereo::MatcherParams;

const DEFAULT_PROGRESS_INTERVAL: u64 = 1;
const DEFAULT_MARKED_FRAMES: usize = crate::frame::MAX_MARKED_FRAMES;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrackerConfigFile {
    segmenter: Option<SegmenterConfigFile>,
    events: Option<EventsConfigFile>,
    stereo: Option<StereoConfigFile>,
    video: Option<VideoConfigFile>,
    run: Option<RunConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SegmenterConfigFile {
    min_area: Option<f64>,
    max_area: Option<f64>,
    kernel_size: Option<u32>,
    close_gaps: Option<bool>,
    history: Option<u32>,
    var_threshold: Option<f32>,
    background_ratio: Option<f32>,
    /// Fixed learning rate; absent means automatic.
    learning_rate: Option<f32>,
    freeze_background: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EventsConfigFile {
    window: Option<usize>,
    cooldown_frames: Option<u32>,
    rule: Option<StabilizationRule>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StereoConfigFile {
    match_threshold: Option<f64>,
    epipolar_tolerance: Option<f64>,
    rectify: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct VideoConfigFile {
    min_width: Option<u32>,
    min_height: Option<u32>,
    max_width: Option<u32>,
    max_height: Option<u32>,
    min_fps: Option<f64>,
    max_fps: Option<f64>,
    default_fps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RunConfigFile {
    progress_interval: Option<u64>,
    finalize_open_events: Option<bool>,
    marked_frames: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub segmenter: SegmenterParams,
    pub events: EventParams,
    pub matcher: MatcherParams,
    /// Remap stereo frames through the calibration before segmentation.
    pub rectify: bool,
    pub video: VideoLimits,
    pub run: RunSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    /// Send progress every N processed frames.
    pub progress_interval: u64,
    /// Close an event still open at the end of the run.
    pub finalize_open_events: bool,
    /// Capacity of the marked-frame buffer.
    pub marked_frames: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            segmenter: SegmenterParams::default(),
            events: EventParams::default(),
            matcher: MatcherParams::default(),
            rectify: false,
            video: VideoLimits::default(),
            run: RunSettings {
                progress_interval: DEFAULT_PROGRESS_INTERVAL,
                finalize_open_events: false,
                marked_frames: DEFAULT_MARKED_FRAMES,
            },
        }
    }
}

impl TrackerConfig {
    /// Defaults, then the file named by `BAT_TRACKER_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("BAT_TRACKER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a config file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let cfg = Self::from_file(read_config_file(path)?);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TrackerConfigFile) -> Self {
        let defaults = Self::default();

        let seg = file.segmenter.unwrap_or_default();
        let learning = if seg.freeze_background.unwrap_or(false) {
            LearningMode::Frozen
        } else {
            seg.learning_rate
                .map(LearningMode::Fixed)
                .unwrap_or(defaults.segmenter.background.learning)
        };
        let area = AreaRange::new(
            seg.min_area.unwrap_or(defaults.segmenter.area.min),
            seg.max_area.unwrap_or(defaults.segmenter.area.max),
        );
        let segmenter = SegmenterParams {
            background: BackgroundParams {
                history: seg.history.unwrap_or(defaults.segmenter.background.history),
                var_threshold: seg
                    .var_threshold
                    .unwrap_or(defaults.segmenter.background.var_threshold),
                background_ratio: seg
                    .background_ratio
                    .unwrap_or(defaults.segmenter.background.background_ratio),
                learning,
                ..defaults.segmenter.background
            },
            kernel_size: seg.kernel_size.unwrap_or(defaults.segmenter.kernel_size),
            close_gaps: seg.close_gaps.unwrap_or(defaults.segmenter.close_gaps),
            area,
        };

        let ev = file.events.unwrap_or_default();
        let events = EventParams {
            window: ev.window.unwrap_or(defaults.events.window),
            cooldown_frames: ev.cooldown_frames.unwrap_or(defaults.events.cooldown_frames),
            rule: ev.rule.unwrap_or(defaults.events.rule),
        };

        let st = file.stereo.unwrap_or_default();
        let matcher = MatcherParams {
            max_y_diff: st.epipolar_tolerance.unwrap_or(defaults.matcher.max_y_diff),
            match_threshold: st.match_threshold.unwrap_or(defaults.matcher.match_threshold),
            area,
        };

        let vid = file.video.unwrap_or_default();
        let video = VideoLimits {
            min_width: vid.min_width.unwrap_or(defaults.video.min_width),
            min_height: vid.min_height.unwrap_or(defaults.video.min_height),
            max_width: vid.max_width.unwrap_or(defaults.video.max_width),
            max_height: vid.max_height.unwrap_or(defaults.video.max_height),
            min_fps: vid.min_fps.unwrap_or(defaults.video.min_fps),
            max_fps: vid.max_fps.unwrap_or(defaults.video.max_fps),
            default_fps: vid.default_fps.unwrap_or(defaults.video.default_fps),
        };

        let run = file.run.unwrap_or_default();
        let run = RunSettings {
            progress_interval: run
                .progress_interval
                .unwrap_or(defaults.run.progress_interval),
            finalize_open_events: run
                .finalize_open_events
                .unwrap_or(defaults.run.finalize_open_events),
            marked_frames: run.marked_frames.unwrap_or(defaults.run.marked_frames),
        };

        Self {
            segmenter,
            events,
            matcher,
            rectify: st.rectify.unwrap_or(defaults.rectify),
            video,
            run,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(min) = env_parse::<f64>("BAT_TRACKER_MIN_AREA")? {
            self.segmenter.area.min = min;
            self.matcher.area.min = min;
        }
        if let Some(max) = env_parse::<f64>("BAT_TRACKER_MAX_AREA")? {
            self.segmenter.area.max = max;
            self.matcher.area.max = max;
        }
        if let Some(size) = env_parse::<u32>("BAT_TRACKER_KERNEL_SIZE")? {
            self.segmenter.kernel_size = size;
        }
        if let Some(window) = env_parse::<usize>("BAT_TRACKER_WINDOW")? {
            self.events.window = window;
        }
        if let Some(frames) = env_parse::<u32>("BAT_TRACKER_COOLDOWN_FRAMES")? {
            self.events.cooldown_frames = frames;
        }
        if let Some(threshold) = env_parse::<f64>("BAT_TRACKER_MATCH_THRESHOLD")? {
            self.matcher.match_threshold = threshold;
        }
        if let Some(tolerance) = env_parse::<f64>("BAT_TRACKER_EPIPOLAR_TOLERANCE")? {
            self.matcher.max_y_diff = tolerance;
        }
        if let Some(fps) = env_parse::<f64>("BAT_TRACKER_DEFAULT_FPS")? {
            self.video.default_fps = fps;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.segmenter.validate()?;
        self.events.validate()?;
        self.matcher.validate()?;
        let v = &self.video;
        if v.min_width == 0 || v.min_height == 0 {
            return Err(anyhow!("minimum video dimensions must be positive"));
        }
        if v.min_width > v.max_width || v.min_height > v.max_height {
            return Err(anyhow!("video dimension limits must satisfy min <= max"));
        }
        if !(v.min_fps > 0.0 && v.min_fps <= v.max_fps) {
            return Err(anyhow!("video fps limits must satisfy 0 < min <= max"));
        }
        if !(v.default_fps >= v.min_fps && v.default_fps <= v.max_fps) {
            return Err(anyhow!(
                "default fps {} lies outside [{}, {}]",
                v.default_fps,
                v.min_fps,
                v.max_fps
            ));
        }
        if self.run.progress_interval == 0 {
            return Err(anyhow!("progress interval must be at least one frame"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, value)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<TrackerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
