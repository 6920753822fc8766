//! Wake-word detection contract.
//!
//! The acoustic keyword model is an external collaborator. The frame source
//! evaluates the detector on every frame regardless of session state and
//! attaches any hit to the frame it sends; the session loop decides whether
//! the hit is actionable (only from Idle or Paused).
//!
//! No keyword model ships with the crate. [`TranscriptWake`] listens for the
//! spoken wake phrases through the transcriber; [`ManualWake`] leaves
//! `trigger_wake` as the only way in.

pub mod transcript;

pub use transcript::{TranscriptWake, WakeTuning};

use crate::buffering::frame::AudioFrame;

/// Wake word detector trait (platform/model adapter).
pub trait WakeWordDetector: Send + 'static {
    /// Evaluate one frame. Returns the detected phrase, if any.
    fn process(&mut self, frame: &AudioFrame) -> Option<String>;

    /// Reset internal state (e.g. between agent runs).
    fn reset(&mut self);
}

/// Detector used when no keyword model is installed.
///
/// Never fires; the agent is woken with the `trigger_wake` command instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualWake;

impl WakeWordDetector for ManualWake {
    fn process(&mut self, _frame: &AudioFrame) -> Option<String> {
        None
    }

    fn reset(&mut self) {}
}

impl<D: WakeWordDetector + ?Sized> WakeWordDetector for Box<D> {
    fn process(&mut self, frame: &AudioFrame) -> Option<String> {
        (**self).process(frame)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}
