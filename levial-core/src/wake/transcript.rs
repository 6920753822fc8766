//! Wake detection by transcribing short speech segments.
//!
//! Stands in for an acoustic keyword model. Voiced segments are cut with the
//! energy VAD; each finished segment goes to the transcriber on a worker
//! thread and the transcript is matched against the wake phrases. A hit is
//! returned from a later `process` call, so the capture thread never waits
//! on the transcriber. Segments that finish while the worker is busy, or
//! while the gate is closed, are dropped.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use super::WakeWordDetector;
use crate::adapters::Transcriber;
use crate::buffering::frame::AudioFrame;
use crate::buffering::utterance::{Utterance, UtteranceBuffer};
use crate::classifier::{Classification, CommandClassifier, ControlPhrase, PhraseSet};
use crate::engine::AudioConfig;
use crate::error::{LevialError, Result};
use crate::vad::{EnergyVad, VoiceActivityDetector};

/// Segment cutting for [`TranscriptWake`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WakeTuning {
    /// Quiet time that closes a segment.
    pub segment_end_silence: Duration,
    /// Segments are cut here even while speech continues.
    pub max_segment: Duration,
    /// Shorter voiced content is never transcribed.
    pub min_voiced: Duration,
}

impl Default for WakeTuning {
    fn default() -> Self {
        Self {
            segment_end_silence: Duration::from_millis(400),
            max_segment: Duration::from_secs(3),
            min_voiced: Duration::from_millis(300),
        }
    }
}

type Gate = Box<dyn Fn() -> bool + Send>;

pub struct TranscriptWake {
    vad: EnergyVad,
    tuning: WakeTuning,
    segment: Option<UtteranceBuffer>,
    quiet: Duration,
    gate: Gate,
    jobs: Sender<Utterance>,
    hits: Receiver<String>,
}

impl TranscriptWake {
    /// Start the worker thread. It exits once the detector is dropped.
    pub fn spawn(
        transcriber: Arc<dyn Transcriber>,
        wake_phrases: &[String],
        audio: &AudioConfig,
        tuning: WakeTuning,
    ) -> Result<Self> {
        let classifier = CommandClassifier::new(&PhraseSet {
            wake: wake_phrases.to_vec(),
            stop_speaking: Vec::new(),
            pause: Vec::new(),
            end_session: Vec::new(),
        });
        let (jobs, job_rx) = crossbeam_channel::bounded::<Utterance>(1);
        let (hit_tx, hits) = crossbeam_channel::unbounded();

        thread::Builder::new()
            .name("levial-wake".into())
            .spawn(move || {
                for clip in job_rx {
                    let text = match transcriber.transcribe(&clip) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("wake transcription failed: {e}");
                            continue;
                        }
                    };
                    match classifier.classify(&text) {
                        Classification::Control {
                            phrase: ControlPhrase::Wake,
                            matched,
                        } => {
                            info!(phrase = matched.as_str(), "wake phrase transcribed");
                            if hit_tx.send(matched).is_err() {
                                break;
                            }
                        }
                        _ => debug!(chars = text.len(), "segment without wake phrase"),
                    }
                }
                debug!("wake worker exiting");
            })
            .map_err(LevialError::Io)?;

        Ok(Self {
            vad: EnergyVad::new(audio.silence_threshold, audio.vad_hangover_frames),
            tuning,
            segment: None,
            quiet: Duration::ZERO,
            gate: Box::new(|| true),
            jobs,
            hits,
        })
    }

    /// Only transcribe segments while `gate` returns `true`.
    pub fn gated(mut self, gate: impl Fn() -> bool + Send + 'static) -> Self {
        self.gate = Box::new(gate);
        self
    }

    fn flush(&mut self) {
        self.quiet = Duration::ZERO;
        let Some(segment) = self.segment.take() else {
            return;
        };
        if segment.voiced() < self.tuning.min_voiced || !(self.gate)() {
            return;
        }
        match self.jobs.try_send(segment.finish()) {
            Ok(()) => debug!("wake segment queued"),
            Err(TrySendError::Full(_)) => debug!("wake worker busy, segment dropped"),
            Err(TrySendError::Disconnected(_)) => warn!("wake worker gone"),
        }
    }
}

impl WakeWordDetector for TranscriptWake {
    fn process(&mut self, frame: &AudioFrame) -> Option<String> {
        let voiced = self.vad.classify(frame).is_speech();
        if voiced || self.segment.is_some() {
            let segment = self
                .segment
                .get_or_insert_with(|| UtteranceBuffer::new(frame.sample_rate));
            segment.push(frame, voiced);
            self.quiet = if voiced {
                Duration::ZERO
            } else {
                self.quiet + frame.duration()
            };
            let done = self.quiet >= self.tuning.segment_end_silence
                || segment.captured() >= self.tuning.max_segment;
            if done {
                self.flush();
            }
        }
        self.hits.try_recv().ok()
    }

    fn reset(&mut self) {
        self.segment = None;
        self.quiet = Duration::ZERO;
        self.vad.reset();
        while self.hits.try_recv().is_ok() {}
    }
}
