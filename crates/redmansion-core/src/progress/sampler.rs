use chrono::{DateTime, Duration, Utc};

/// Default minimum time between two scroll evaluations.
pub const DEFAULT_SCROLL_SAMPLE_MS: i64 = 200;

/// Index of the paragraph being read at `scroll_top`.
///
/// `anchors` are the paragraph top offsets in document order. The last
/// anchor at or above the scroll position wins; defaults to 0.
pub fn select_paragraph(anchors: &[f64], scroll_top: f64) -> usize {
    let mut selected = 0;
    for (index, &offset) in anchors.iter().enumerate() {
        if offset > scroll_top {
            break;
        }
        selected = index;
    }
    selected
}

/// Whole-number completion for chapter `number` of `total`, clamped to 0..=100.
pub fn percent_complete(number: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (f64::from(number) / f64::from(total) * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

/// Throttled scroll sampling. Holds the latest paragraph index; never writes.
#[derive(Debug, Clone)]
pub struct ScrollSampler {
    interval: Duration,
    last_sample_at: Option<DateTime<Utc>>,
    latest: usize,
}

impl ScrollSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sample_at: None,
            latest: 0,
        }
    }

    /// Evaluate a sample unless the previous evaluation was less than one
    /// interval ago. The first sample is always evaluated.
    pub fn sample(&mut self, anchors: &[f64], scroll_top: f64, now: DateTime<Utc>) -> Option<usize> {
        if let Some(last) = self.last_sample_at {
            if now - last < self.interval {
                return None;
            }
        }
        self.last_sample_at = Some(now);
        self.latest = select_paragraph(anchors, scroll_top);
        Some(self.latest)
    }

    pub fn latest(&self) -> usize {
        self.latest
    }

    pub fn reset(&mut self) {
        self.last_sample_at = None;
        self.latest = 0;
    }
}

impl Default for ScrollSampler {
    fn default() -> Self {
        Self::new(Duration::milliseconds(DEFAULT_SCROLL_SAMPLE_MS))
    }
}
