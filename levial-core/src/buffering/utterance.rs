//! Utterance accumulation between wake detection and end-of-turn silence.

use std::time::Duration;

use super::frame::AudioFrame;

/// Audio captured for one utterance.
///
/// Owned exclusively by the Listening state (and by the barge-in monitor while
/// Speaking). Finalised into an [`Utterance`] or discarded, never reused.
#[derive(Debug)]
pub struct UtteranceBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    captured: Duration,
    voiced: Duration,
}

impl UtteranceBuffer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            captured: Duration::ZERO,
            voiced: Duration::ZERO,
        }
    }

    /// Append a frame. `voiced` is the caller's speech decision for it.
    pub fn push(&mut self, frame: &AudioFrame, voiced: bool) {
        self.samples.extend_from_slice(&frame.samples);
        let duration = frame.duration();
        self.captured += duration;
        if voiced {
            self.voiced += duration;
        }
    }

    /// Total audio captured so far.
    pub fn captured(&self) -> Duration {
        self.captured
    }

    /// Audio that was classified as speech.
    pub fn voiced(&self) -> Duration {
        self.voiced
    }

    /// True when the buffer holds less than `min_voiced` of speech.
    pub fn is_near_silent(&self, min_voiced: Duration) -> bool {
        self.voiced < min_voiced
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Consume the buffer into an immutable utterance for the transcriber.
    pub fn finish(self) -> Utterance {
        Utterance {
            samples: self.samples,
            sample_rate: self.sample_rate,
        }
    }
}

/// A finalised utterance handed to the transcriber.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Utterance {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}
