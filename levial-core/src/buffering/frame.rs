//! Fixed-duration audio frame passed from the frame source to the event loop.

use std::time::{Duration, Instant};

/// A contiguous block of mono PCM samples with its energy summary.
///
/// Produced on the frame-source thread; consumed by the detectors and the
/// utterance buffer. Never retained after the turn completes.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Capture time of the first sample.
    pub timestamp: Instant,
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (16 kHz after resampling).
    pub sample_rate: u32,
    /// Root-mean-square level of `samples`.
    pub level: f32,
}

impl AudioFrame {
    /// Build a frame and compute its RMS level.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        let level = rms(&samples);
        Self {
            timestamp: Instant::now(),
            samples,
            sample_rate,
            level,
        }
    }

    /// Duration covered by this frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Root-mean-square of a sample slice. Empty input is silent.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
