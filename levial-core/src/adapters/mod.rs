//! Service adapter contracts.
//!
//! Each adapter is a single blocking request → response call. The session
//! loop never calls them directly: [`call_with_timeout`] runs the call on the
//! blocking pool and enforces the per-stage timeout. A timed-out call is not
//! terminated by the orchestrator; its result is simply never observed.
//! Adapters that wrap a child process kill it on their own deadline
//! (see [`process`]).

pub mod ollama;
pub mod piper;
pub mod process;
pub mod stub;
pub mod whisper;

pub use ollama::OllamaResponder;
pub use piper::PiperCli;
pub use process::ProcessPlayer;
pub use whisper::WhisperCli;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffering::utterance::Utterance;
use crate::profile::UserProfile;

/// Which adapter failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStage {
    Transcription,
    Generation,
    Synthesis,
    Playback,
}

impl fmt::Display for AdapterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterStage::Transcription => "Transcription",
            AdapterStage::Generation => "Generation",
            AdapterStage::Synthesis => "Synthesis",
            AdapterStage::Playback => "Playback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    Timeout,
    Failure,
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterErrorKind::Timeout => f.write_str("Timeout"),
            AdapterErrorKind::Failure => f.write_str("Failure"),
        }
    }
}

/// Failure of a single adapter call. Displays as e.g.
/// `TranscriptionTimeout: no result after 30s`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage}{kind}: {detail}")]
pub struct AdapterError {
    pub stage: AdapterStage,
    pub kind: AdapterErrorKind,
    pub detail: String,
}

impl AdapterError {
    pub fn failure(stage: AdapterStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            kind: AdapterErrorKind::Failure,
            detail: detail.into(),
        }
    }

    pub fn timeout(stage: AdapterStage, after: Duration) -> Self {
        Self {
            stage,
            kind: AdapterErrorKind::Timeout,
            detail: format!("no result after {after:?}"),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == AdapterErrorKind::Timeout
    }
}

/// One finished exchange, oldest first in the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub user: String,
    pub assistant: String,
}

/// Everything the responder collaborator receives for one generation.
#[derive(Debug, Clone)]
pub struct ResponderRequest {
    pub transcript: String,
    pub history: Vec<Turn>,
    pub profile: UserProfile,
    /// Pass-through from live config; the session itself does not act on it.
    pub proactivity_level: f32,
}

/// Playable output of the synthesizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechClip {
    /// Audio file written by the synthesizer.
    File(PathBuf),
    /// No audio; playback just waits this long (stub synthesizer).
    Silent(Duration),
}

/// Speech-to-text backend.
///
/// Shared behind an `Arc` and called from blocking-pool threads, so `&self`
/// methods must tolerate concurrent calls. The wake detector and the session
/// loop may transcribe at the same time.
pub trait Transcriber: Send + Sync + 'static {
    /// Transcribe one finished utterance.
    ///
    /// # Parameters
    /// - `utterance`: Mono f32 samples at the capture rate, leading and
    ///   trailing silence included.
    ///
    /// # Returns
    /// The transcript. Blank when nothing intelligible was said; the loop
    /// trims it and treats a blank result as a no-op turn, not an error.
    ///
    /// # Errors
    /// `Transcription` stage errors. Implementations that own a deadline
    /// report it as `Timeout`.
    fn transcribe(&self, utterance: &Utterance) -> Result<String, AdapterError>;
}

/// Language model that produces the assistant reply for one turn.
pub trait Responder: Send + Sync + 'static {
    /// # Parameters
    /// - `request`: The transcript plus bounded history and the profile
    ///   snapshot taken when the turn began.
    ///
    /// # Errors
    /// `Generation` stage errors.
    fn respond(&self, request: &ResponderRequest) -> Result<String, AdapterError>;
}

/// Text-to-speech backend.
pub trait Synthesizer: Send + Sync + 'static {
    /// Render `text` into something [`Playback`] can play.
    ///
    /// # Errors
    /// `Synthesis` stage errors.
    fn synthesize(&self, text: &str) -> Result<SpeechClip, AdapterError>;
}

/// Audio output. Owned by the Speaking state.
///
/// ## Stopping
/// The loop sets `stop` when the turn is abandoned (barge-in and
/// `stop_agent`) and when the session loop exits. `play` blocks its blocking-pool thread, so implementations must
/// poll the flag and return promptly once it is set; the loop does not wait
/// for them.
pub trait Playback: Send + Sync + 'static {
    /// Play `clip` to completion, returning early once `stop` is set.
    ///
    /// # Errors
    /// `Playback` stage errors. An interrupted clip is `Ok(())`.
    fn play(&self, clip: &SpeechClip, stop: &AtomicBool) -> Result<(), AdapterError>;
}

/// The external collaborators the session loop dispatches to.
#[derive(Clone)]
pub struct Services {
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn Responder>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub playback: Arc<dyn Playback>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// Run a blocking adapter call on the blocking pool with a deadline.
///
/// The timeout surfaces as `AdapterErrorKind::Timeout`; a panicking adapter
/// surfaces as a failure of the same stage.
pub async fn call_with_timeout<T, F>(
    stage: AdapterStage,
    timeout: Duration,
    work: F,
) -> Result<T, AdapterError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AdapterError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(AdapterError::failure(
            stage,
            format!("worker task died: {join_err}"),
        )),
        Err(_) => Err(AdapterError::timeout(stage, timeout)),
    }
}
