//! Orchestrator configuration.
//!
//! [`OrchestratorConfig`] is fixed for the lifetime of a loop except for its
//! [`LiveConfig`] part, which `update_config` patches at runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::PhraseSet;
use crate::ipc::ConfigPatch;

/// Ceiling for every seconds-valued setting (one day).
pub const MAX_CONFIG_SECS: f32 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub live: LiveConfig,
    pub bounds: ConfigBounds,
    /// Wake and control phrase lists. Not hot-reloadable.
    pub phrases: PhraseSet,
    pub timeouts: AdapterTimeouts,
    pub audio: AudioConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            live: LiveConfig::default(),
            bounds: ConfigBounds::default(),
            phrases: PhraseSet::default(),
            timeouts: AdapterTimeouts::default(),
            audio: AudioConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Clamp every numeric field into its valid range.
    pub fn normalize(&mut self) {
        self.bounds.normalize();
        self.live.clamp_to(&self.bounds);
        self.timeouts.normalize();
        self.audio.normalize();
    }
}

/// Parameters read live by the session loop on every evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// End-of-turn silence, seconds.
    pub silence_duration_secs: f32,
    /// 0..1, handed to the responder untouched.
    pub proactivity_level: f32,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            silence_duration_secs: 1.5,
            proactivity_level: 0.0,
        }
    }
}

impl LiveConfig {
    pub fn silence_timeout(&self) -> Duration {
        secs(self.silence_duration_secs)
    }

    /// Apply a patch, clamping values to `bounds`. Non-finite values are
    /// ignored. Returns `true` if anything changed.
    pub fn apply(&mut self, patch: &ConfigPatch, bounds: &ConfigBounds) -> bool {
        let before = *self;
        if let Some(secs) = patch.silence_duration.filter(|v| v.is_finite()) {
            self.silence_duration_secs = bounds.clamp_silence(secs);
        }
        if let Some(level) = patch.proactivity_level.filter(|v| v.is_finite()) {
            self.proactivity_level = level.clamp(0.0, 1.0);
        }
        *self != before
    }

    fn clamp_to(&mut self, bounds: &ConfigBounds) {
        self.silence_duration_secs = if self.silence_duration_secs.is_finite() {
            bounds.clamp_silence(self.silence_duration_secs)
        } else {
            LiveConfig::default().silence_duration_secs
        };
        self.proactivity_level = if self.proactivity_level.is_finite() {
            self.proactivity_level.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigBounds {
    pub silence_duration_min_secs: f32,
    pub silence_duration_max_secs: f32,
}

impl Default for ConfigBounds {
    fn default() -> Self {
        Self {
            silence_duration_min_secs: 0.3,
            silence_duration_max_secs: 10.0,
        }
    }
}

impl ConfigBounds {
    pub fn clamp_silence(&self, secs: f32) -> f32 {
        secs.clamp(self.silence_duration_min_secs, self.silence_duration_max_secs)
    }

    fn normalize(&mut self) {
        let defaults = Self::default();
        if !self.silence_duration_min_secs.is_finite() || self.silence_duration_min_secs <= 0.0 {
            self.silence_duration_min_secs = defaults.silence_duration_min_secs;
        }
        if !self.silence_duration_max_secs.is_finite() {
            self.silence_duration_max_secs = defaults.silence_duration_max_secs;
        }
        self.silence_duration_min_secs = self.silence_duration_min_secs.min(MAX_CONFIG_SECS);
        self.silence_duration_max_secs = self.silence_duration_max_secs.min(MAX_CONFIG_SECS);
        if self.silence_duration_max_secs < self.silence_duration_min_secs {
            self.silence_duration_max_secs = self.silence_duration_min_secs;
        }
    }
}

/// Per-adapter deadlines, seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterTimeouts {
    pub transcription_secs: f32,
    pub generation_secs: f32,
    pub synthesis_secs: f32,
    /// Ceiling on a single playback.
    pub playback_secs: f32,
}

impl Default for AdapterTimeouts {
    fn default() -> Self {
        Self {
            transcription_secs: 30.0,
            generation_secs: 60.0,
            synthesis_secs: 30.0,
            playback_secs: 120.0,
        }
    }
}

impl AdapterTimeouts {
    pub fn transcription(&self) -> Duration {
        secs(self.transcription_secs)
    }

    pub fn generation(&self) -> Duration {
        secs(self.generation_secs)
    }

    pub fn synthesis(&self) -> Duration {
        secs(self.synthesis_secs)
    }

    pub fn playback(&self) -> Duration {
        secs(self.playback_secs)
    }

    fn normalize(&mut self) {
        let defaults = Self::default();
        fix_positive(&mut self.transcription_secs, defaults.transcription_secs);
        fix_positive(&mut self.generation_secs, defaults.generation_secs);
        fix_positive(&mut self.synthesis_secs, defaults.synthesis_secs);
        fix_positive(&mut self.playback_secs, defaults.playback_secs);
    }
}

/// Frame production and detector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Rate frames are delivered at, after resampling.
    pub target_sample_rate: u32,
    /// Samples per frame at `target_sample_rate` (1280 = 80 ms at 16 kHz).
    pub frame_samples: usize,
    /// RMS below which a frame counts as silence.
    pub silence_threshold: f32,
    /// Frames of speech hangover for the voiced/unvoiced decision.
    pub vad_hangover_frames: u32,
    /// Less voiced audio than this is a false wake.
    pub min_voiced_secs: f32,
    /// Listening finalises early at this length.
    pub max_utterance_secs: f32,
    /// `audio_level = min(rms * gain, 1)`.
    pub level_gain: f32,
    pub level_interval_ms: u64,
    /// Silence closing a barge-in capture while Speaking.
    pub barge_in_silence_secs: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16_000,
            frame_samples: 1_280,
            silence_threshold: 0.01,
            vad_hangover_frames: 2,
            min_voiced_secs: 0.15,
            max_utterance_secs: 30.0,
            level_gain: 5.0,
            level_interval_ms: 100,
            barge_in_silence_secs: 1.0,
        }
    }
}

impl AudioConfig {
    pub fn min_voiced(&self) -> Duration {
        secs(self.min_voiced_secs)
    }

    pub fn max_utterance(&self) -> Duration {
        secs(self.max_utterance_secs)
    }

    pub fn level_interval(&self) -> Duration {
        Duration::from_millis(self.level_interval_ms)
    }

    pub fn barge_in_silence(&self) -> Duration {
        secs(self.barge_in_silence_secs)
    }

    /// Scale a raw RMS into the `[0, 1]` telemetry range.
    pub fn scaled_level(&self, rms: f32) -> f32 {
        (rms * self.level_gain).clamp(0.0, 1.0)
    }

    fn normalize(&mut self) {
        let defaults = Self::default();
        if self.target_sample_rate == 0 {
            self.target_sample_rate = defaults.target_sample_rate;
        }
        if self.frame_samples == 0 {
            self.frame_samples = defaults.frame_samples;
        }
        if !self.silence_threshold.is_finite() || self.silence_threshold < 0.0 {
            self.silence_threshold = defaults.silence_threshold;
        }
        if !self.min_voiced_secs.is_finite() || self.min_voiced_secs < 0.0 {
            self.min_voiced_secs = defaults.min_voiced_secs;
        }
        self.min_voiced_secs = self.min_voiced_secs.min(MAX_CONFIG_SECS);
        fix_positive(&mut self.max_utterance_secs, defaults.max_utterance_secs);
        if !self.level_gain.is_finite() || self.level_gain <= 0.0 {
            self.level_gain = defaults.level_gain;
        }
        fix_positive(&mut self.barge_in_silence_secs, defaults.barge_in_silence_secs);
    }
}

/// Seconds to `Duration`, saturating instead of panicking on huge values.
fn secs(value: f32) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f32(value).unwrap_or(Duration::MAX)
}

fn fix_positive(value: &mut f32, fallback: f32) {
    if !value.is_finite() || *value <= 0.0 {
        *value = fallback;
    }
    *value = value.min(MAX_CONFIG_SECS);
}
