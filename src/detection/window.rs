use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionSample {
    pub at: Instant,
    pub off_track: bool,
}

/// Trailing, time-bounded set of verdicts.
///
/// Samples older than `length` relative to the newest one are dropped before
/// any ratio is computed.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    length: Duration,
    samples: VecDeque<DetectionSample>,
}

impl SlidingWindow {
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            samples: VecDeque::new(),
        }
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    pub fn push(&mut self, at: Instant, off_track: bool) {
        self.samples.push_back(DetectionSample { at, off_track });
        self.prune(at);
    }

    pub fn prune(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > self.length {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Off-track share of the window; `None` while empty.
    pub fn ratio(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.off_track_count() as f64 / self.samples.len() as f64)
    }

    pub fn off_track_count(&self) -> usize {
        self.samples.iter().filter(|sample| sample.off_track).count()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
