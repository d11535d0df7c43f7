//! Utility functions for time keeping and display formatting.

pub mod clock;
pub mod format;

// Re-export commonly used items at module level
pub use clock::{Clock, ManualClock, SystemClock};
pub use format::{format_age, normalize_key};
