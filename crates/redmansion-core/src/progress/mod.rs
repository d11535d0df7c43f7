pub mod error;
pub mod sampler;
pub mod tracker;

pub use error::ProgressError;
pub use sampler::{percent_complete, select_paragraph, ScrollSampler, DEFAULT_SCROLL_SAMPLE_MS};
pub use tracker::{
    ChapterLoadOutcome, ExitReason, ReadingProgressTracker, ResumePoint, TrackerConfig,
};
