//! Stub services for development without local models installed.
//!
//! Deterministic: the transcriber reports what it received, the responder
//! echoes, the synthesizer returns a silent clip sized to the text.

use std::time::Duration;

use tracing::debug;

use super::{AdapterError, Responder, ResponderRequest, SpeechClip, Synthesizer, Transcriber};
use crate::buffering::utterance::Utterance;

#[derive(Debug, Default, Clone)]
pub struct StubTranscriber;

impl Transcriber for StubTranscriber {
    fn transcribe(&self, utterance: &Utterance) -> Result<String, AdapterError> {
        debug!(samples = utterance.samples.len(), "StubTranscriber::transcribe");
        Ok(format!(
            "[stub: {} samples @ {} Hz]",
            utterance.samples.len(),
            utterance.sample_rate
        ))
    }
}

#[derive(Debug, Default, Clone)]
pub struct StubResponder;

impl Responder for StubResponder {
    fn respond(&self, request: &ResponderRequest) -> Result<String, AdapterError> {
        Ok(format!("You said: {}", request.transcript))
    }
}

/// Silent clip of ~60 ms per word.
#[derive(Debug, Default, Clone)]
pub struct StubSynthesizer;

impl Synthesizer for StubSynthesizer {
    fn synthesize(&self, text: &str) -> Result<SpeechClip, AdapterError> {
        let words = text.split_whitespace().count() as u64;
        Ok(SpeechClip::Silent(Duration::from_millis(60 * words.max(1))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::UserProfile;

    #[test]
    fn stub_transcriber_reports_sample_count() {
        let text = StubTranscriber
            .transcribe(&Utterance {
                samples: vec![0.0; 320],
                sample_rate: 16_000,
            })
            .expect("stub transcribe");
        assert_eq!(text, "[stub: 320 samples @ 16000 Hz]");
    }

    #[test]
    fn stub_responder_echoes() {
        let reply = StubResponder
            .respond(&ResponderRequest {
                transcript: "hello".into(),
                history: vec![],
                profile: UserProfile::default(),
                proactivity_level: 0.0,
            })
            .expect("stub respond");
        assert_eq!(reply, "You said: hello");
    }

    #[test]
    fn stub_synthesizer_scales_with_words() {
        let clip = StubSynthesizer.synthesize("one two three").expect("stub synth");
        assert_eq!(clip, SpeechClip::Silent(Duration::from_millis(180)));
    }
}
