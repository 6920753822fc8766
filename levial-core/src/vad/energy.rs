//! RMS-threshold VAD with a short hangover so trailing syllables stay voiced.

use super::{VadDecision, VoiceActivityDetector};
use crate::buffering::frame::AudioFrame;

#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f32,
    hangover_frames: u32,
    remaining: u32,
}

impl EnergyVad {
    /// `hangover_frames` quiet frames after a loud one still count as speech
    /// (2 frames = 160 ms at 16 kHz / 1280 samples).
    pub fn new(threshold: f32, hangover_frames: u32) -> Self {
        Self {
            threshold,
            hangover_frames,
            remaining: 0,
        }
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(0.01, 2)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, frame: &AudioFrame) -> VadDecision {
        if frame.level >= self.threshold {
            self.remaining = self.hangover_frames;
            return VadDecision::Speech;
        }
        match self.remaining.checked_sub(1) {
            Some(left) => {
                self.remaining = left;
                VadDecision::Speech
            }
            None => VadDecision::Silence,
        }
    }

    fn reset(&mut self) {
        self.remaining = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 1_280;

    fn frame(amplitude: f32) -> AudioFrame {
        AudioFrame::new(vec![amplitude; FRAME], 16_000)
    }

    #[test]
    fn quiet_room_is_silence() {
        let mut vad = EnergyVad::default();
        assert!(!vad.classify(&frame(0.004)).is_speech());
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut vad = EnergyVad::new(0.25, 0);
        assert!(vad.classify(&frame(0.25)).is_speech());
    }

    #[test]
    fn hangover_covers_short_gaps_then_expires() {
        let mut vad = EnergyVad::new(0.02, 2);
        let labels: Vec<bool> = [0.3, 0.0, 0.0, 0.0, 0.3, 0.0]
            .iter()
            .map(|&a| vad.classify(&frame(a)).is_speech())
            .collect();
        assert_eq!(labels, vec![true, true, true, false, true, true]);
    }

    #[test]
    fn reset_drops_pending_hangover() {
        let mut vad = EnergyVad::new(0.02, 4);
        vad.classify(&frame(0.4));
        vad.reset();
        assert_eq!(vad.classify(&frame(0.0)), VadDecision::Silence);
    }

    #[test]
    fn empty_frame_is_silence() {
        let mut vad = EnergyVad::default();
        let empty = AudioFrame::new(Vec::new(), 16_000);
        assert_eq!(vad.classify(&empty), VadDecision::Silence);
    }
}
