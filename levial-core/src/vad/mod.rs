//! Voice activity and end-of-turn detection.
//!
//! `VoiceActivityDetector` labels single frames; the loop uses the labels to
//! count voiced time in an utterance and to open a barge-in capture.
//! `SilenceDetector` measures consecutive sub-threshold time and fires once
//! the live silence timeout is exceeded.

pub mod energy;
pub mod silence;

pub use energy::EnergyVad;
pub use silence::SilenceDetector;

use crate::buffering::frame::AudioFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    /// Below threshold with no hangover left.
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        matches!(self, VadDecision::Speech)
    }
}

pub trait VoiceActivityDetector: Send + 'static {
    fn classify(&mut self, frame: &AudioFrame) -> VadDecision;

    /// Forget hangover state, e.g. at the start of a new capture.
    fn reset(&mut self);
}
