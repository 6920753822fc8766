//! # levial-core
//!
//! Voice-interaction orchestrator: turns a microphone stream into a
//! turn-taking conversation with local transcription, generation and
//! synthesis services, and publishes live state to any number of observers.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC ring → frame source thread
//!                                  (resample, 80 ms frames, wake detector)
//!                                              │ try_send
//!                                              ▼
//!   ControlCommand ──────────────────►  SessionLoop (single tokio task)
//!                                        │            ▲
//!                              dispatch  │            │ epoch-tagged completions
//!                                        ▼            │
//!                      Transcriber / Responder / Synthesizer / Playback
//!                                        │
//!                                        ▼
//!                         ObserverHub ──► observers (OutboundEvent)
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod adapters;
pub mod audio;
pub mod buffering;
pub mod classifier;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod ipc;
pub mod profile;
pub mod vad;
pub mod wake;

pub use adapters::{AdapterError, AdapterStage, Services};
pub use engine::{
    Collaborators, CommandSender, Orchestrator, OrchestratorConfig, SessionState,
};
pub use error::{LevialError, Result};
pub use gateway::{ObserverHub, ObserverId, StatusSnapshot};
pub use ipc::{ControlCommand, OutboundEvent, ProtocolError};
pub use profile::{JsonProfileStore, ProfileDelta, ProfileStore, UserProfile};
