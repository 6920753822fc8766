//! End-of-turn silence timer.
//!
//! Accumulates the duration of consecutive frames whose level is below the
//! energy threshold. Time is measured in audio (frame durations), not wall
//! clock, so the detector is deterministic under load. The timeout is passed
//! on every call, which lets a live config update shorten or extend the wait
//! for the utterance already in progress.

use std::time::Duration;

use crate::buffering::frame::AudioFrame;

#[derive(Debug, Clone)]
pub struct SilenceDetector {
    threshold: f32,
    silent_for: Duration,
    fired: bool,
}

impl SilenceDetector {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            silent_for: Duration::ZERO,
            fired: false,
        }
    }

    /// Feed one frame. Returns `true` exactly once per silence run, on the
    /// first frame where the accumulated silence reaches `timeout`.
    pub fn observe(&mut self, frame: &AudioFrame, timeout: Duration) -> bool {
        if frame.level >= self.threshold {
            self.silent_for = Duration::ZERO;
            self.fired = false;
            return false;
        }
        self.silent_for += frame.duration();
        if !self.fired && self.silent_for >= timeout {
            self.fired = true;
            return true;
        }
        false
    }

    /// Consecutive silence accumulated so far.
    pub fn silent_for(&self) -> Duration {
        self.silent_for
    }

    pub fn reset(&mut self) {
        self.silent_for = Duration::ZERO;
        self.fired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(amplitude: f32) -> AudioFrame {
        // 80 ms at 16 kHz
        AudioFrame::new(vec![amplitude; 1280], 16_000)
    }

    #[test]
    fn fires_once_after_timeout_of_silence() {
        let mut detector = SilenceDetector::new(0.01);
        let timeout = Duration::from_millis(1500);

        let fired = (0..40)
            .filter(|_| detector.observe(&frame(0.0), timeout))
            .count();
        assert_eq!(fired, 1);
    }

    #[test]
    fn fires_on_first_frame_reaching_timeout() {
        let mut detector = SilenceDetector::new(0.01);
        let timeout = Duration::from_millis(1500);

        // 18 frames = 1.44 s: not yet
        for _ in 0..18 {
            assert!(!detector.observe(&frame(0.0), timeout));
        }
        // 19th frame = 1.52 s
        assert!(detector.observe(&frame(0.0), timeout));
    }

    #[test]
    fn speech_resets_the_run() {
        let mut detector = SilenceDetector::new(0.01);
        let timeout = Duration::from_millis(400);

        for _ in 0..4 {
            assert!(!detector.observe(&frame(0.0), timeout));
        }
        assert!(!detector.observe(&frame(0.3), timeout));
        assert_eq!(detector.silent_for(), Duration::ZERO);
        for _ in 0..4 {
            assert!(!detector.observe(&frame(0.0), timeout));
        }
        assert!(detector.observe(&frame(0.0), timeout));
    }

    #[test]
    fn shorter_timeout_applies_to_run_in_progress() {
        let mut detector = SilenceDetector::new(0.01);

        for _ in 0..10 {
            assert!(!detector.observe(&frame(0.0), Duration::from_millis(1500)));
        }
        // 800 ms already accumulated; a 500 ms timeout fires on the next frame.
        assert!(detector.observe(&frame(0.0), Duration::from_millis(500)));
    }
}
