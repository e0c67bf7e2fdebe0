mod detector;
mod window;

pub use detector::{DetectorConfig, InterruptionDetector, PauseSink};
pub use window::{DetectionSample, SlidingWindow};
