mod backend;
pub mod background;
pub mod contour;
pub mod morphology;
mod result;
mod scripted;
mod segmenter;

pub use backend::MotionDetector;
pub use background::{BackgroundModel, BackgroundParams, LearningMode};
pub use result::{primary, AreaRange, DetectionCandidate, MAX_AREA, MIN_AREA};
pub use scripted::{candidate, ScriptedDetector};
pub use segmenter::{MotionSegmenter, SegmenterParams, SegmenterSession, SegmenterState, NOISE_KERNEL};
