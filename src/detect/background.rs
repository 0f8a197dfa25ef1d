//! Per-pixel adaptive Gaussian-mixture background model.
//!
//! Each pixel keeps up to `MIXTURES` weighted Gaussian components sorted by
//! weight. A sample is background when it falls within `var_threshold`
//! (squared Mahalanobis distance) of a component that belongs to the
//! dominant set whose cumulative weight stays below `background_ratio`.
//! Samples that match no component spawn a new one and are foreground.
//!
//! The model is mutated on every `apply` call; frames must arrive in order.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::frame::GrayImage;

/// Components per pixel.
pub const MIXTURES: usize = 3;

const FOREGROUND: u8 = 255;
const BACKGROUND: u8 = 0;

/// How the model adapts to each new frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "rate")]
pub enum LearningMode {
    /// Rate `1 / min(2n, history)` where `n` is the number of frames seen.
    Auto,
    /// Constant rate in (0, 1].
    Fixed(f32),
    /// Classify only; the model is never updated.
    Frozen,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackgroundParams {
    pub history: u32,
    pub var_threshold: f32,
    /// Squared distance under which a sample updates a component.
    pub var_threshold_gen: f32,
    pub background_ratio: f32,
    pub var_init: f32,
    pub var_min: f32,
    pub var_max: f32,
    /// Weight decay that prunes components which are rarely matched.
    pub complexity_reduction: f32,
    pub learning: LearningMode,
}

impl Default for BackgroundParams {
    fn default() -> Self {
        Self {
            history: 500,
            var_threshold: 16.0,
            var_threshold_gen: 9.0,
            background_ratio: 0.9,
            var_init: 15.0,
            var_min: 4.0,
            var_max: 75.0,
            complexity_reduction: 0.05,
            learning: LearningMode::Auto,
        }
    }
}

impl BackgroundParams {
    pub fn validate(&self) -> Result<()> {
        if self.history == 0 {
            return Err(anyhow!("background history must be at least one frame"));
        }
        if self.var_threshold <= 0.0 || self.var_threshold_gen <= 0.0 {
            return Err(anyhow!("background variance thresholds must be positive"));
        }
        if !(0.0..=1.0).contains(&self.background_ratio) {
            return Err(anyhow!("background ratio must be within [0, 1]"));
        }
        if self.var_min <= 0.0 || self.var_min > self.var_max {
            return Err(anyhow!("background variance clamp must satisfy 0 < min <= max"));
        }
        if let LearningMode::Fixed(rate) = self.learning {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(anyhow!("fixed learning rate must be in (0, 1]"));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Component {
    weight: f32,
    mean: f32,
    var: f32,
}

/// Mixture state for one stream. Created lazily for the first frame's size.
#[derive(Clone, Debug)]
pub struct BackgroundModel {
    params: BackgroundParams,
    width: u32,
    height: u32,
    components: Vec<[Component; MIXTURES]>,
    used: Vec<u8>,
    frames_seen: u64,
}

impl BackgroundModel {
    pub fn new(params: BackgroundParams) -> Self {
        Self {
            params,
            width: 0,
            height: 0,
            components: Vec::new(),
            used: Vec::new(),
            frames_seen: 0,
        }
    }

    pub fn params(&self) -> &BackgroundParams {
        &self.params
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Learning rate for the frame about to be applied.
    fn learning_rate(&self) -> f32 {
        match self.params.learning {
            LearningMode::Frozen => 0.0,
            LearningMode::Fixed(rate) => rate,
            LearningMode::Auto => {
                let n = (2 * self.frames_seen).min(self.params.history as u64).max(1);
                1.0 / n as f32
            }
        }
    }

    /// Classify `gray` and update the model. Returns a 0/255 foreground mask.
    pub fn apply(&mut self, gray: &GrayImage) -> Result<GrayImage> {
        if self.components.is_empty() {
            self.width = gray.width();
            self.height = gray.height();
            self.components = vec![[Component::default(); MIXTURES]; gray.as_raw().len()];
            self.used = vec![0; gray.as_raw().len()];
        } else if gray.dimensions() != (self.width, self.height) {
            return Err(anyhow!(
                "background model is {}x{}, got {}x{} frame",
                self.width,
                self.height,
                gray.width(),
                gray.height()
            ));
        }

        self.frames_seen += 1;
        let frozen = matches!(self.params.learning, LearningMode::Frozen);
        let rate = self.learning_rate();

        let mut mask = Vec::with_capacity(gray.as_raw().len());
        for (i, &px) in gray.as_raw().iter().enumerate() {
            let background = if frozen {
                self.classify(i, px as f32)
            } else {
                self.update(i, px as f32, rate)
            };
            mask.push(if background { BACKGROUND } else { FOREGROUND });
        }
        GrayImage::from_raw(self.width, self.height, mask)
            .ok_or_else(|| anyhow!("foreground mask does not match {}x{}", self.width, self.height))
    }

    fn classify(&self, i: usize, px: f32) -> bool {
        let p = &self.params;
        let mut total = 0.0f32;
        for c in &self.components[i][..self.used[i] as usize] {
            let d = c.mean - px;
            if total < p.background_ratio && d * d < p.var_threshold * c.var {
                return true;
            }
            total += c.weight;
        }
        false
    }

    fn update(&mut self, i: usize, px: f32, alpha: f32) -> bool {
        let p = &self.params;
        let modes = &mut self.components[i];
        let mut used = self.used[i] as usize;
        let decay = 1.0 - alpha;
        let prune = -alpha * p.complexity_reduction;

        let mut fits = false;
        let mut background = false;
        let mut total = 0.0f32;

        let mut m = 0;
        while m < used {
            let mut weight = decay * modes[m].weight + prune;
            let mut swap_from = None;

            if !fits {
                let var = modes[m].var;
                let d = modes[m].mean - px;
                let dist2 = d * d;

                if total < p.background_ratio && dist2 < p.var_threshold * var {
                    background = true;
                }

                if dist2 < p.var_threshold_gen * var {
                    fits = true;
                    weight += alpha;
                    let k = alpha / weight;
                    modes[m].mean -= k * d;
                    modes[m].var = (var + k * (dist2 - var)).clamp(p.var_min, p.var_max);
                    swap_from = Some(m);
                }
            }

            if weight < -prune {
                weight = 0.0;
                used -= 1;
            }
            modes[m].weight = weight;
            total += weight;

            if let Some(mut j) = swap_from {
                // Keep components sorted by descending weight.
                while j > 0 && modes[j].weight > modes[j - 1].weight {
                    modes.swap(j, j - 1);
                    j -= 1;
                }
            }
            m += 1;
        }

        if total > 0.0 {
            let inv = 1.0 / total;
            for c in modes[..used].iter_mut() {
                c.weight *= inv;
            }
        }

        if !fits && alpha > 0.0 {
            let slot = if used == MIXTURES {
                MIXTURES - 1
            } else {
                used += 1;
                used - 1
            };
            if used == 1 {
                modes[slot].weight = 1.0;
            } else {
                modes[slot].weight = alpha;
                for c in modes[..used - 1].iter_mut() {
                    c.weight *= decay;
                }
            }
            modes[slot].mean = px;
            modes[slot].var = p.var_init;

            let mut j = slot;
            while j > 0 && alpha > modes[j - 1].weight {
                modes.swap(j, j - 1);
                j -= 1;
            }
        }

        self.used[i] = used as u8;
        background
    }
}
